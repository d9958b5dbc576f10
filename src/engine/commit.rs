//! The write pipeline: from a typed content value to a persisted commit.
//!
//! All steps run inside one storage transaction owned by the facade:
//! validate, serialize and hash, token-count, store the blob (dedup), read
//! HEAD, enforce the budget, compute the commit hash, validate edit
//! preconditions, persist the row and parent edges, move HEAD, and
//! auto-annotate types whose default priority differs from NORMAL. Any
//! failure aborts the enclosing transaction; HEAD is unchanged, though the
//! blob may remain (content-addressed, it is reused on the next attempt).

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::config::{BudgetBreach, BudgetPolicy};
use crate::content::ContentRegistry;
use crate::engine::tokens::TokenCounter;
use crate::errors::{Result, TractError};
use crate::hash::{canonical_json, commit_hash, content_hash};
use crate::model::{
    BlobRecord, CommitInfo, CommitRecord, GenerationConfig, Operation, Priority, ToolSchemaRecord,
    timestamp_iso,
};
use crate::storage::{NewAnnotation, Storage, reachable_commits};

/// UTC clock issuing strictly increasing timestamps within one process.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock::default()
    }

    /// Next timestamp: wall clock, bumped by a microsecond whenever the
    /// wall clock has not advanced past the previous issue.
    pub fn next(&self) -> DateTime<Utc> {
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut now = Utc::now();
        if let Some(previous) = *last {
            if now <= previous {
                now = previous + Duration::microseconds(1);
            }
        }
        *last = Some(now);
        now
    }
}

/// Optional fields of a commit request.
#[derive(Default)]
pub struct CommitParams<'a> {
    pub operation: Operation,
    pub message: Option<String>,
    pub edit_target: Option<String>,
    pub metadata: Option<Value>,
    pub generation_config: Option<GenerationConfig>,
    /// Tool schemas active at this commit, linked in order.
    pub tools: Option<&'a [Value]>,
    /// Extra parents of a merge commit (positions 1..).
    pub extra_parents: Vec<String>,
}

/// Budget enforcement inputs, owned by the facade.
pub struct BudgetGuard<'a> {
    pub budget: Option<u64>,
    pub policy: BudgetPolicy,
    pub callback: Option<&'a dyn Fn(BudgetBreach)>,
}

/// The write-path engine. Stateless apart from the injected clock; one per
/// facade call site.
pub struct CommitEngine<'a> {
    storage: &'a dyn Storage,
    counter: &'a dyn TokenCounter,
    registry: &'a ContentRegistry,
    clock: &'a MonotonicClock,
}

impl<'a> CommitEngine<'a> {
    pub fn new(
        storage: &'a dyn Storage,
        counter: &'a dyn TokenCounter,
        registry: &'a ContentRegistry,
        clock: &'a MonotonicClock,
    ) -> Self {
        CommitEngine {
            storage,
            counter,
            registry,
            clock,
        }
    }

    /// The clock backing this engine's identity timestamps.
    pub fn clock(&self) -> &MonotonicClock {
        self.clock
    }

    /// The content type registry this engine validates against.
    pub fn registry(&self) -> &ContentRegistry {
        self.registry
    }

    /// Run the full write pipeline for one content value.
    pub fn create_commit(
        &self,
        tract_id: &str,
        content: &Value,
        params: CommitParams<'_>,
        budget: &BudgetGuard<'_>,
    ) -> Result<CommitInfo> {
        // 1. type dispatch: per-instance registry first, then built-ins
        let content_type = self.registry.validate(content)?;
        if params.operation == Operation::Append && params.edit_target.is_some() {
            return Err(TractError::InvalidArgument(
                "`edit_target` is only valid for edit commits".to_string(),
            ));
        }

        // 2-3. canonical identity and token accounting
        let canonical = canonical_json(content);
        let blob_hash = content_hash(content);
        let text = crate::content::extract_text(content);
        let token_count = self.counter.count_text(&text);

        // 4. dedup blob store
        self.storage.blobs().save_if_absent(BlobRecord {
            content_hash: blob_hash.clone(),
            payload: content.clone(),
            byte_size: canonical.len(),
            token_count,
            created_at: self.clock.next(),
        })?;

        // 5. current position
        let parent_hash = self.storage.refs().get_head(tract_id)?;

        // 6. budget
        self.check_budget(parent_hash.as_deref(), token_count, budget)?;

        // 7-8. identity timestamp and commit hash
        let created_at = self.clock.next();
        let edit_target = params.edit_target.as_deref();
        let hash = commit_hash(
            &blob_hash,
            parent_hash.as_deref(),
            &params.extra_parents,
            &content_type,
            params.operation.as_str(),
            &timestamp_iso(created_at),
            edit_target,
        );

        // 9. edit preconditions
        if params.operation == Operation::Edit {
            self.validate_edit_target(tract_id, edit_target)?;
        }

        // 10. persist row and merge edges
        let row = CommitRecord {
            commit_hash: hash.clone(),
            tract_id: tract_id.to_string(),
            parent_hash: parent_hash.clone(),
            content_hash: blob_hash,
            content_type: content_type.clone(),
            operation: params.operation,
            edit_target: params.edit_target.clone(),
            message: params.message.clone(),
            token_count,
            metadata: params.metadata.clone(),
            generation_config: params.generation_config.clone(),
            created_at,
        };
        self.storage.commits().save(row)?;
        if !params.extra_parents.is_empty() {
            let mut sorted = params.extra_parents.clone();
            sorted.sort();
            self.storage.parents().add_parents(&hash, &sorted, 1)?;
        }

        // tool provenance
        if let Some(schemas) = params.tools {
            self.link_tools(&hash, schemas)?;
        }

        // 11. move HEAD (symbolic-aware; the detached guard lives in the facade)
        self.storage.refs().update_head(tract_id, &hash)?;

        // 12. types that default away from NORMAL get their priority on record
        let default_priority = self.registry.hints_for(&content_type).default_priority;
        if default_priority != Priority::Normal {
            self.storage.annotations().save(NewAnnotation {
                tract_id: tract_id.to_string(),
                target_hash: hash.clone(),
                priority: default_priority,
                reason: Some(format!("default priority for {content_type}")),
                retention: None,
                created_at: self.clock.next(),
            })?;
        }

        Ok(CommitInfo {
            commit_hash: hash,
            parent_hash,
            content_type,
            operation: params.operation,
            message: params.message,
            edit_target: params.edit_target,
            token_count,
            created_at,
        })
    }

    fn check_budget(
        &self,
        parent_hash: Option<&str>,
        attempted: u64,
        budget: &BudgetGuard<'_>,
    ) -> Result<()> {
        let Some(limit) = budget.budget else {
            return Ok(());
        };
        let ancestor_tokens: u64 = match parent_hash {
            Some(parent) => reachable_commits(self.storage, parent)?
                .iter()
                .map(|row| row.token_count)
                .sum(),
            None => 0,
        };
        let total = ancestor_tokens + attempted;
        if total <= limit {
            return Ok(());
        }
        match budget.policy {
            BudgetPolicy::Reject => Err(TractError::BudgetExceeded {
                total,
                budget: limit,
                attempted,
            }),
            BudgetPolicy::Warn => {
                tracing::warn!(total, budget = limit, attempted, "token budget exceeded");
                Ok(())
            }
            BudgetPolicy::Callback => {
                if let Some(callback) = budget.callback {
                    callback(BudgetBreach {
                        total,
                        budget: limit,
                        attempted,
                    });
                } else {
                    tracing::warn!(
                        total,
                        budget = limit,
                        "budget callback policy set but no callback registered"
                    );
                }
                Ok(())
            }
        }
    }

    fn validate_edit_target(&self, tract_id: &str, edit_target: Option<&str>) -> Result<()> {
        let Some(target) = edit_target else {
            return Err(TractError::EditTarget {
                target: None,
                reason: "edit commits require an edit_target".to_string(),
            });
        };
        let Some(row) = self.storage.commits().get(target)? else {
            return Err(TractError::EditTarget {
                target: Some(target.to_string()),
                reason: "target commit does not exist".to_string(),
            });
        };
        if row.tract_id != tract_id {
            return Err(TractError::EditTarget {
                target: Some(target.to_string()),
                reason: "target belongs to a different tract".to_string(),
            });
        }
        if row.operation == Operation::Edit {
            return Err(TractError::EditTarget {
                target: Some(target.to_string()),
                reason: "cannot edit an edit; target the original append".to_string(),
            });
        }
        Ok(())
    }

    fn link_tools(&self, hash: &str, schemas: &[Value]) -> Result<()> {
        for (position, schema) in schemas.iter().enumerate() {
            let tool_hash = content_hash(schema);
            let name = schema
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            self.storage.tools().store(ToolSchemaRecord {
                content_hash: tool_hash.clone(),
                name,
                schema: schema.clone(),
                created_at: self.clock.next(),
            })?;
            self.storage
                .tools()
                .link_to_commit(hash, &tool_hash, position as u32)?;
        }
        Ok(())
    }
}
