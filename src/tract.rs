//! The facade: one isolated context store.
//!
//! A `Tract` owns one storage session, one compile cache, one content type
//! registry, and (optionally) one LLM client. Every mutating call runs in a
//! storage transaction: the facade begins it, the engine and operations
//! stage writes, and the facade commits or rolls back. A [`Tract::batch`]
//! scope folds many calls into one transaction.
//!
//! ```text
//!   write path                       read path
//!   ──────────                       ─────────
//!   commit(content)                  compile()
//!     │ validate / hash / count        │ cache hit? ── yes ─▶ snapshot
//!     │ blob dedup                     │ no
//!     │ budget check                   │ walk DAG (topo order)
//!     │ commit row + edges             │ resolve edits, priorities
//!     │ move HEAD                      │ map roles, aggregate runs
//!     │ auto-annotate                  │ count tokens
//!     ▼                                ▼
//!   CommitInfo                       CompiledContext ──▶ cache
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::config::{AutonomyMode, BudgetBreach, TractConfig};
use crate::content::{Content, ContentRegistry, CustomContentType, extract_text};
use crate::engine::cache::{AppendExtension, CacheManager, CompileSnapshot, EditExtension};
use crate::engine::commit::{BudgetGuard, CommitEngine, CommitParams, MonotonicClock};
use crate::engine::compile::{CompileOptions, CompiledContext, CompiledMessage, Compiler, role_for};
use crate::engine::tokens::{BpeTokenCounter, TokenCounter};
use crate::errors::{Result, TractError};
use crate::llm::{ChatOptions, LLMClient, Resolver};
use crate::model::{
    AnnotationRecord, CommitInfo, GenerationConfig, Operation, Priority, RetentionCriteria,
};
use crate::ops::compress::{
    CompressOptions, PendingCompression, commit_compression, plan_compression,
};
use crate::ops::diff::{DiffResult, diff as diff_op, implicit_base};
use crate::ops::merge::{MergeOutcome, MergeStrategy, merge as merge_op};
use crate::ops::navigate::{
    CheckoutOutcome, ResetMode, checkout as checkout_op, create_branch, delete_branch,
    log as log_op, reset as reset_op, resolve_commit,
};
use crate::ops::rebase::{RebaseOutcome, cherry_pick as cherry_pick_op, rebase as rebase_op};
use crate::storage::{NewAnnotation, Storage, memory::MemoryStorage};

/// Result of a compression request: either already committed or a proposal
/// awaiting approval.
#[derive(Debug)]
pub enum CompressionOutcome {
    Committed(CommitInfo),
    Pending(PendingCompression),
}

/// Optional fields of a facade commit.
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    pub message: Option<String>,
    pub metadata: Option<Value>,
    pub generation_config: Option<GenerationConfig>,
}

/// Reborrows an `Option<&mut dyn Resolver>` with the lifetime of the outer
/// reference, rather than the shorter lifetime `Option::as_deref_mut` infers
/// when called across a closure/function boundary.
fn reborrow_resolver<'s>(
    resolver: &'s mut Option<&mut dyn Resolver>,
) -> Option<&'s mut dyn Resolver> {
    match resolver {
        Some(r) => Some(&mut **r),
        None => None,
    }
}

/// A single, isolated context store.
pub struct Tract {
    tract_id: String,
    storage: Box<dyn Storage>,
    counter: Box<dyn TokenCounter>,
    registry: ContentRegistry,
    cache: CacheManager,
    config: TractConfig,
    clock: MonotonicClock,
    llm: Option<Arc<dyn LLMClient>>,
    llm_owned: bool,
    budget_callback: Option<Box<dyn Fn(BudgetBreach)>>,
    role_overrides: Option<HashMap<String, String>>,
    /// Tool schemas linked to every subsequent commit.
    active_tools: Option<Vec<Value>>,
    batch_depth: u32,
}

impl Tract {
    /// Open a tract over the in-memory backend with a fresh id, attached to
    /// `main`.
    pub fn in_memory(config: TractConfig) -> Result<Self> {
        let id = Uuid::new_v4().to_string();
        Tract::open(Box::new(MemoryStorage::new()), &id, config)
    }

    /// Open a tract over an existing backend. Initialises HEAD (attached to
    /// `main`) when the tract is new.
    pub fn open(storage: Box<dyn Storage>, tract_id: &str, config: TractConfig) -> Result<Self> {
        let version = storage.schema_version()?;
        tracing::debug!(tract = %tract_id, schema = version, "opening tract");
        if storage.refs().get_ref(tract_id, crate::model::HEAD)?.is_none() {
            storage.refs().attach_head(tract_id, "main")?;
        }
        Ok(Tract {
            tract_id: tract_id.to_string(),
            counter: Box::new(BpeTokenCounter::new(config.token_model.clone())),
            cache: CacheManager::new(config.cache_capacity),
            registry: ContentRegistry::new(),
            clock: MonotonicClock::new(),
            llm: None,
            llm_owned: false,
            budget_callback: None,
            role_overrides: None,
            active_tools: None,
            batch_depth: 0,
            storage,
            config,
        })
    }

    /// Borrow an LLM client; the tract never closes it.
    pub fn with_llm_client(mut self, client: Arc<dyn LLMClient>) -> Self {
        self.llm = Some(client);
        self.llm_owned = false;
        self
    }

    /// Own an LLM client; closed on [`Tract::close`].
    pub fn with_owned_llm_client(mut self, client: Arc<dyn LLMClient>) -> Self {
        self.llm = Some(client);
        self.llm_owned = true;
        self
    }

    /// Replace the token counter (tests use the null counter).
    pub fn with_token_counter(mut self, counter: Box<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn tract_id(&self) -> &str {
        &self.tract_id
    }

    pub fn config(&self) -> &TractConfig {
        &self.config
    }

    /// Register a custom content type; shadows a built-in of the same name.
    pub fn register_content_type(&mut self, content_type: CustomContentType) {
        self.registry.register(content_type);
        self.cache.clear();
    }

    /// Force a compile role for a content type.
    pub fn set_role_override(&mut self, content_type: impl Into<String>, role: impl Into<String>) {
        self.role_overrides
            .get_or_insert_with(HashMap::new)
            .insert(content_type.into(), role.into());
        self.cache.clear();
    }

    /// Tool schemas linked to every commit from here on; `None` clears.
    pub fn set_active_tools(&mut self, tools: Option<Vec<Value>>) {
        self.active_tools = tools;
    }

    /// Invoked when the budget breaches under the `Callback` policy.
    pub fn set_budget_callback(&mut self, callback: impl Fn(BudgetBreach) + 'static) {
        self.budget_callback = Some(Box::new(callback));
    }

    /// Release owned resources; idempotent.
    pub fn close(&mut self) {
        if self.llm_owned {
            if let Some(client) = self.llm.take() {
                client.close();
            }
        }
        self.llm = None;
        self.cache.clear();
    }

    // ── positions ────────────────────────────────────────────────────

    /// Current HEAD commit hash, if any.
    pub fn head(&self) -> Result<Option<String>> {
        self.storage.refs().get_head(&self.tract_id)
    }

    /// Branch HEAD is attached to, if not detached.
    pub fn current_branch(&self) -> Result<Option<String>> {
        self.storage.refs().head_branch(&self.tract_id)
    }

    pub fn is_detached(&self) -> Result<bool> {
        self.storage.refs().is_detached(&self.tract_id)
    }

    /// Resolve a ref, branch, or hash prefix to a full commit hash.
    pub fn resolve(&self, target: &str) -> Result<String> {
        resolve_commit(&*self.storage, &self.tract_id, target)
    }

    /// Head-first history along primary parents.
    pub fn log(&self, limit: Option<usize>) -> Result<Vec<CommitInfo>> {
        log_op(&*self.storage, &self.tract_id, limit)
    }

    /// Look up one commit by any resolvable name.
    pub fn commit_info(&self, target: &str) -> Result<CommitInfo> {
        let hash = self.resolve(target)?;
        self.storage
            .commits()
            .get(&hash)?
            .map(|row| CommitInfo::from(&row))
            .ok_or(TractError::CommitNotFound(hash))
    }

    /// Annotation history of a commit, oldest first.
    pub fn annotation_history(&self, target: &str) -> Result<Vec<AnnotationRecord>> {
        let hash = self.resolve(target)?;
        self.storage.annotations().get_history(&hash)
    }

    /// All parents of a commit: the primary parent followed by any merge
    /// parents in position order.
    pub fn parents_of(&self, target: &str) -> Result<Vec<String>> {
        let hash = self.resolve(target)?;
        let row = self
            .storage
            .commits()
            .get(&hash)?
            .ok_or(TractError::CommitNotFound(hash.clone()))?;
        let mut parents: Vec<String> = row.parent_hash.into_iter().collect();
        parents.extend(self.storage.parents().get_parents(&hash)?);
        Ok(parents)
    }

    // ── write path ───────────────────────────────────────────────────

    /// Append typed content at HEAD.
    pub fn commit(&mut self, content: Content) -> Result<CommitInfo> {
        self.commit_with(content, CommitOptions::default())
    }

    pub fn commit_with(&mut self, content: Content, options: CommitOptions) -> Result<CommitInfo> {
        self.commit_value(content.to_value(), options, Operation::Append, None)
    }

    /// Append a raw JSON body; its discriminator is validated against the
    /// registry (custom types included).
    pub fn commit_raw(&mut self, value: Value) -> Result<CommitInfo> {
        self.commit_value(value, CommitOptions::default(), Operation::Append, None)
    }

    /// Replace the effective content at `target`'s position.
    pub fn edit(&mut self, target: &str, content: Content) -> Result<CommitInfo> {
        self.edit_with(target, content, CommitOptions::default())
    }

    pub fn edit_with(
        &mut self,
        target: &str,
        content: Content,
        options: CommitOptions,
    ) -> Result<CommitInfo> {
        let target_hash = self.resolve(target)?;
        self.commit_value(content.to_value(), options, Operation::Edit, Some(target_hash))
    }

    fn commit_value(
        &mut self,
        value: Value,
        options: CommitOptions,
        operation: Operation,
        edit_target: Option<String>,
    ) -> Result<CommitInfo> {
        self.ensure_attached()?;
        let active_tools = self.active_tools.clone();
        let info = self.transactional(|t| {
            let engine = CommitEngine::new(&*t.storage, &*t.counter, &t.registry, &t.clock);
            engine.create_commit(
                &t.tract_id,
                &value,
                CommitParams {
                    operation,
                    message: options.message.clone(),
                    edit_target: edit_target.clone(),
                    metadata: options.metadata.clone(),
                    generation_config: options.generation_config.clone(),
                    tools: active_tools.as_deref(),
                    extra_parents: Vec::new(),
                },
                &t.budget_guard(),
            )
        })?;
        self.extend_cache(&info, &value, options.generation_config.as_ref());
        Ok(info)
    }

    /// Keep the snapshot cache warm across the two cheap mutations.
    fn extend_cache(
        &mut self,
        info: &CommitInfo,
        value: &Value,
        generation_config: Option<&GenerationConfig>,
    ) {
        let Some(parent) = &info.parent_hash else {
            return;
        };
        let hints = self.registry.hints_for(&info.content_type);
        let message = CompiledMessage {
            role: role_for(
                &self.registry,
                self.role_overrides.as_ref(),
                &info.content_type,
                value,
            ),
            content: extract_text(value),
            name: value.get("name").and_then(Value::as_str).map(String::from),
        };
        match info.operation {
            Operation::Append => {
                if hints.default_priority == Priority::Skip {
                    // the new commit would not surface; a fresh compile is
                    // the only safe answer
                    self.cache.invalidate(parent);
                    return;
                }
                self.cache.extend_for_append(
                    parent,
                    &AppendExtension {
                        commit_hash: info.commit_hash.clone(),
                        message,
                        aggregation: hints.aggregation,
                        generation_config: generation_config.cloned(),
                        tool_hashes: self
                            .storage
                            .tools()
                            .get_commit_tool_hashes(&info.commit_hash)
                            .unwrap_or_default(),
                    },
                    &*self.counter,
                );
            }
            Operation::Edit => {
                let Some(target) = &info.edit_target else {
                    return;
                };
                self.cache.extend_for_edit(
                    parent,
                    &EditExtension {
                        commit_hash: info.commit_hash.clone(),
                        target_hash: target.clone(),
                        message,
                        generation_config: generation_config.cloned(),
                    },
                    &*self.counter,
                );
            }
        }
    }

    // ── read path ────────────────────────────────────────────────────

    /// Compile the current HEAD.
    pub fn compile(&mut self) -> Result<CompiledContext> {
        self.compile_with(CompileOptions::default())
    }

    /// Compile with cutoffs. Only default-option compiles touch the cache.
    pub fn compile_with(&mut self, options: CompileOptions) -> Result<CompiledContext> {
        let head = self.head()?;
        if options.is_default() {
            if let Some(hash) = &head {
                if let Some(snapshot) = self.cache.get(hash) {
                    return snapshot.into_context(&*self.storage);
                }
            }
        }

        let compiler = Compiler::new(
            &*self.storage,
            &*self.counter,
            &self.registry,
            self.role_overrides.as_ref(),
        );
        let context = compiler.compile(&self.tract_id, head.as_deref(), &options)?;

        if options.is_default() {
            if let Some(hash) = head {
                let last_aggregation = match context.commit_hashes.last() {
                    Some(last) => self
                        .storage
                        .commits()
                        .get(last)?
                        .map(|row| self.registry.hints_for(&row.content_type).aggregation)
                        .unwrap_or_default(),
                    None => Default::default(),
                };
                self.cache
                    .put(hash, CompileSnapshot::from_context(&context, last_aggregation));
            }
        }
        Ok(context)
    }

    // ── annotations ──────────────────────────────────────────────────

    /// Append a priority annotation; the latest annotation per target wins.
    pub fn annotate(
        &mut self,
        target: &str,
        priority: Priority,
        reason: Option<String>,
        retention: Option<RetentionCriteria>,
    ) -> Result<AnnotationRecord> {
        let hash = self.resolve(target)?;
        let record = self.transactional(|t| {
            t.storage.annotations().save(NewAnnotation {
                tract_id: t.tract_id.clone(),
                target_hash: hash.clone(),
                priority,
                reason: reason.clone(),
                retention: retention.clone(),
                created_at: t.clock.next(),
            })
        })?;
        // priorities reshape every snapshot whose history contains the target
        self.cache.clear();
        Ok(record)
    }

    // ── navigation ───────────────────────────────────────────────────

    /// Move HEAD (and its branch, when attached), saving `ORIG_HEAD` and
    /// `PREV_HEAD`.
    pub fn reset(&mut self, target: &str, mode: ResetMode) -> Result<String> {
        self.transactional(|t| reset_op(&*t.storage, &t.tract_id, target, mode))
    }

    /// Check out a branch, commit, or `"-"`. Previously compiled positions
    /// stay cached; the cache is keyed by HEAD hash.
    pub fn checkout(&mut self, target: &str) -> Result<CheckoutOutcome> {
        self.transactional(|t| checkout_op(&*t.storage, &t.tract_id, target))
    }

    /// Create a branch at `at` (or HEAD).
    pub fn branch(&mut self, name: &str, at: Option<&str>) -> Result<String> {
        self.transactional(|t| create_branch(&*t.storage, &t.tract_id, name, at))
    }

    pub fn delete_branch(&mut self, name: &str) -> Result<()> {
        self.transactional(|t| delete_branch(&*t.storage, &t.tract_id, name))
    }

    /// Branch names and their tips.
    pub fn branches(&self) -> Result<Vec<(String, Option<String>)>> {
        self.storage.refs().list_branches(&self.tract_id)
    }

    // ── diff ─────────────────────────────────────────────────────────

    /// Diff two compiled positions. With `a = None`, an EDIT commit diffs
    /// against its target and anything else against its parent.
    pub fn diff(&self, a: Option<&str>, b: &str) -> Result<DiffResult> {
        let b_hash = self.resolve(b)?;
        let a_hash = match a {
            Some(target) => Some(self.resolve(target)?),
            None => implicit_base(&*self.storage, &b_hash)?,
        };
        let compiler = Compiler::new(
            &*self.storage,
            &*self.counter,
            &self.registry,
            self.role_overrides.as_ref(),
        );
        diff_op(
            &*self.storage,
            &compiler,
            &self.tract_id,
            a_hash.as_deref(),
            &b_hash,
        )
    }

    // ── DAG operations ───────────────────────────────────────────────

    /// Merge `source` into the current branch.
    pub fn merge(
        &mut self,
        source: &str,
        strategy: MergeStrategy,
        mut resolver: Option<&mut dyn Resolver>,
    ) -> Result<MergeOutcome> {
        self.ensure_attached()?;
        self.transactional(|t| {
            let engine = CommitEngine::new(&*t.storage, &*t.counter, &t.registry, &t.clock);
            merge_op(
                &*t.storage,
                &engine,
                &t.budget_guard(),
                &t.tract_id,
                source,
                strategy,
                reborrow_resolver(&mut resolver),
            )
        })
    }

    /// Replay the current branch onto `onto`.
    pub fn rebase(
        &mut self,
        onto: &str,
        mut resolver: Option<&mut dyn Resolver>,
    ) -> Result<RebaseOutcome> {
        self.ensure_attached()?;
        let outcome = self.transactional(|t| {
            let engine = CommitEngine::new(&*t.storage, &*t.counter, &t.registry, &t.clock);
            rebase_op(
                &*t.storage,
                &engine,
                &t.budget_guard(),
                &t.tract_id,
                onto,
                reborrow_resolver(&mut resolver),
            )
        })?;
        // carried annotations may retarget commits inside cached histories
        self.cache.clear();
        Ok(outcome)
    }

    /// Replay one commit onto HEAD.
    pub fn cherry_pick(&mut self, target: &str) -> Result<CommitInfo> {
        self.ensure_attached()?;
        self.transactional(|t| {
            let engine = CommitEngine::new(&*t.storage, &*t.counter, &t.registry, &t.clock);
            cherry_pick_op(&*t.storage, &engine, &t.budget_guard(), &t.tract_id, target)
        })
    }

    // ── compression ──────────────────────────────────────────────────

    /// Compress a commit range into a summary.
    ///
    /// The summarization happens before any write; under an autonomous
    /// mode (or `auto_commit = true`) the summary is committed directly,
    /// otherwise a [`PendingCompression`] proposal is returned for
    /// [`Tract::approve_compression`].
    pub fn compress(&mut self, mut options: CompressOptions) -> Result<CompressionOutcome> {
        self.ensure_attached()?;
        let client = self.require_llm()?;
        if options.expected_head.is_none() {
            options.expected_head = self.head()?;
        }
        let auto_commit = options
            .auto_commit
            .unwrap_or(self.config.autonomy == AutonomyMode::Autonomous);

        // plan first: LLM calls never run inside a storage transaction
        let pending = plan_compression(
            &*self.storage,
            &self.registry,
            &*client,
            &self.tract_id,
            &options,
            self.config.compression_group_size,
            self.config.max_retries,
        )?;

        if auto_commit {
            Ok(CompressionOutcome::Committed(
                self.approve_compression(&pending)?,
            ))
        } else {
            Ok(CompressionOutcome::Pending(pending))
        }
    }

    /// Commit a (possibly edited) compression proposal.
    pub fn approve_compression(&mut self, pending: &PendingCompression) -> Result<CommitInfo> {
        self.ensure_attached()?;
        let info = self.transactional(|t| {
            let engine = CommitEngine::new(&*t.storage, &*t.counter, &t.registry, &t.clock);
            commit_compression(&*t.storage, &engine, &t.budget_guard(), &t.tract_id, pending)
        })?;
        // the subsumed commits' skip annotations reshape cached histories
        self.cache.clear();
        Ok(info)
    }

    // ── generation ───────────────────────────────────────────────────

    /// Compile at HEAD, ask the LLM, and commit the assistant reply.
    pub fn generate(&mut self) -> Result<CommitInfo> {
        self.generate_validated(|_| None, false)
    }

    /// Validator-guarded generation. A rejection commits a user-role
    /// steering message with the diagnosis and retries; with `purify`, HEAD
    /// is restored to the pre-retry point and the clean reply re-committed,
    /// leaving the retry commits orphaned but queryable via `ORIG_HEAD`.
    pub fn generate_validated(
        &mut self,
        mut validate: impl FnMut(&str) -> Option<String>,
        purify: bool,
    ) -> Result<CommitInfo> {
        self.ensure_attached()?;
        let client = self.require_llm()?;
        let max_retries = self.config.max_retries;

        self.batch(|t| {
            let this = std::cell::RefCell::new(t);
            let controls = crate::ops::retry::RetryControls {
                max_retries,
                purify,
                provenance_note: None,
            };
            let outcome = crate::ops::retry::retry_with_steering(
                &controls,
                |_| {
                    let context = this.borrow_mut().compile()?;
                    let response = client.chat(&context.chat_messages(), &ChatOptions::default());
                    response.map_err(TractError::from)
                },
                |response| Ok(validate(&response.text)),
                |diagnosis| {
                    this.borrow_mut()
                        .commit_with(
                            Content::user(diagnosis),
                            CommitOptions {
                                message: Some("steer generation".to_string()),
                                ..Default::default()
                            },
                        )
                        .map(|_| ())
                },
                || this.borrow().head(),
                |head| this.borrow_mut().reset(head, ResetMode::Soft).map(|_| ()),
            )?;

            let response = outcome.value;
            this.borrow_mut().commit_with(
                Content::assistant(response.text),
                CommitOptions {
                    message: Some("generated reply".to_string()),
                    generation_config: Some(GenerationConfig {
                        model: Some(response.model),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
        })
    }

    // ── scopes and transactions ──────────────────────────────────────

    /// Run many operations in one atomic storage transaction; an error
    /// rolls back the whole scope.
    pub fn batch<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        if self.batch_depth > 0 {
            return f(self);
        }
        self.storage.begin()?;
        self.batch_depth += 1;
        let result = f(self);
        self.batch_depth -= 1;
        match result {
            Ok(value) => {
                self.storage.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.storage.rollback() {
                    tracing::error!("rollback failed: {rollback}");
                }
                // discard snapshots that may describe rolled-back state
                self.cache.clear();
                Err(e)
            }
        }
    }

    fn transactional<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        self.batch(f)
    }

    fn budget_guard(&self) -> BudgetGuard<'_> {
        BudgetGuard {
            budget: self.config.token_budget,
            policy: self.config.budget_policy,
            callback: self.budget_callback.as_deref(),
        }
    }

    fn ensure_attached(&self) -> Result<()> {
        if self.is_detached()? {
            let at = self.head()?.unwrap_or_default();
            return Err(TractError::DetachedHead { at });
        }
        Ok(())
    }

    fn require_llm(&self) -> Result<Arc<dyn LLMClient>> {
        self.llm.clone().ok_or_else(|| {
            TractError::InvalidArgument("no LLM client configured for this tract".to_string())
        })
    }
}

impl std::fmt::Debug for Tract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tract")
            .field("tract_id", &self.tract_id)
            .field("has_llm", &self.llm.is_some())
            .finish_non_exhaustive()
    }
}
