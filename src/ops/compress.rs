//! History compression: summarize a commit range into one summary commit.
//!
//! The range is partitioned by effective priority: skipped commits are
//! excluded, pinned commits pass through untouched, and the rest is
//! summarized in batches by the LLM collaborator. IMPORTANT commits inject
//! their retention instructions into the prompt and validate the produced
//! summary against deterministic patterns, retrying with steering on
//! failure. Committing the result appends the summary and annotates the
//! subsumed commits as skipped; the originals stay reachable.

use regex::Regex;

use crate::content::{Content, ContentRegistry, extract_text};
use crate::engine::commit::{BudgetGuard, CommitEngine, CommitParams};
use crate::errors::{Result, TractError};
use crate::llm::{ChatMessage, ChatOptions, LLMClient};
use crate::model::{
    CommitInfo, CommitRecord, MatchMode, Operation, Priority, RetentionCriteria,
};
use crate::ops::navigate::resolve_commit;
use crate::ops::retry::{RetryControls, retry_with_steering};
use crate::storage::{NewAnnotation, Storage, topological_order};

const SUMMARY_PROMPT: &str = "Summarize the following conversation excerpt. Preserve decisions, \
facts, figures, and commitments; drop pleasantries and repetition. Respond with the summary only.";

/// Inputs of a compression request.
#[derive(Debug, Clone, Default)]
pub struct CompressOptions {
    /// First commit of the range (inclusive), as a resolvable committish.
    pub from: String,
    /// Last commit of the range (inclusive).
    pub to: String,
    /// Per-batch token bound; falls back to a fixed batch size.
    pub target_tokens: Option<u64>,
    /// Extra caller guidance injected into the summarization prompt.
    pub instructions: Option<String>,
    /// Commit directly instead of returning a proposal. `None` defers to
    /// the configured autonomy mode.
    pub auto_commit: Option<bool>,
    /// Fail if HEAD is no longer here when the summary is committed.
    pub expected_head: Option<String>,
}

/// A planned but uncommitted compression. Holds only in-memory state: a
/// process crash discards it.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCompression {
    summary_text: String,
    pub from_hash: String,
    pub to_hash: String,
    /// Compressible commits the summary replaces.
    pub subsumed: Vec<String>,
    /// Pinned commits left untouched by the compression.
    pub pinned: Vec<String>,
    pub expected_head: Option<String>,
    /// LLM attempts consumed across all batches.
    pub attempts: u32,
}

impl PendingCompression {
    pub fn summary(&self) -> &str {
        &self.summary_text
    }

    /// Replace the proposed summary before approval.
    pub fn edit_summary(&mut self, new_text: impl Into<String>) {
        self.summary_text = new_text.into();
    }
}

struct Compressible {
    row: CommitRecord,
    text: String,
    role: String,
    priority: Priority,
    retention: Option<RetentionCriteria>,
}

/// Plan a compression: resolve the range, partition by priority, summarize
/// batch by batch, and validate retention. Nothing is written.
#[allow(clippy::too_many_arguments)]
pub fn plan_compression(
    storage: &dyn Storage,
    registry: &ContentRegistry,
    client: &dyn LLMClient,
    tract_id: &str,
    options: &CompressOptions,
    group_size: usize,
    max_retries: u32,
) -> Result<PendingCompression> {
    let head = storage.refs().get_head(tract_id)?.ok_or_else(|| {
        TractError::Compression("cannot compress an empty history".to_string())
    })?;
    let from_hash = resolve_commit(storage, tract_id, &options.from)?;
    let to_hash = resolve_commit(storage, tract_id, &options.to)?;

    let order = topological_order(storage, &head)?;
    let position = |hash: &str| order.iter().position(|row| row.commit_hash == hash);
    let (Some(from_index), Some(to_index)) = (position(&from_hash), position(&to_hash)) else {
        return Err(TractError::Compression(
            "range endpoints are not reachable from HEAD".to_string(),
        ));
    };
    if from_index > to_index {
        return Err(TractError::InvalidArgument(
            "`from` must not come after `to`".to_string(),
        ));
    }
    let range = &order[from_index..=to_index];

    // effective text follows the latest edit, exactly as compilation does
    let edit_map: std::collections::HashMap<String, &CommitRecord> = {
        let mut map = std::collections::HashMap::new();
        for row in &order {
            if row.operation != Operation::Edit {
                continue;
            }
            if let Some(target) = &row.edit_target {
                let newer = map.get(target).is_none_or(|current: &&CommitRecord| {
                    (row.created_at, &row.commit_hash) > (current.created_at, &current.commit_hash)
                });
                if newer {
                    map.insert(target.clone(), row);
                }
            }
        }
        map
    };

    let append_hashes: Vec<String> = range
        .iter()
        .filter(|row| row.operation == Operation::Append)
        .map(|row| row.commit_hash.clone())
        .collect();
    let annotations = storage.annotations().batch_get_latest(&append_hashes, None)?;

    let mut pinned: Vec<String> = Vec::new();
    let mut compressible: Vec<Compressible> = Vec::new();
    for row in range.iter().filter(|row| row.operation == Operation::Append) {
        let annotation = annotations.get(&row.commit_hash);
        let priority = annotation.map(|a| a.priority).unwrap_or_else(|| {
            registry.hints_for(&row.content_type).default_priority
        });
        match priority {
            Priority::Skip => {}
            Priority::Pinned => pinned.push(row.commit_hash.clone()),
            Priority::Normal | Priority::Important => {
                let source = edit_map.get(&row.commit_hash).copied().unwrap_or(row);
                let blob = storage.blobs().get(&source.content_hash)?.ok_or_else(|| {
                    TractError::storage(format!("missing blob {}", source.content_hash))
                })?;
                compressible.push(Compressible {
                    text: extract_text(&blob.payload),
                    role: crate::engine::compile::role_for(
                        registry,
                        None,
                        &source.content_type,
                        &blob.payload,
                    ),
                    priority,
                    retention: annotation.and_then(|a| a.retention.clone()),
                    row: row.clone(),
                });
            }
        }
    }
    if compressible.is_empty() {
        return Err(TractError::Compression(
            "no compressible commits in range".to_string(),
        ));
    }

    let groups = group_by_budget(&compressible, options.target_tokens, group_size);
    let mut summaries: Vec<String> = Vec::new();
    let mut attempts_total = 0u32;
    for group in groups {
        let (summary, attempts) = summarize_group(
            client,
            group,
            options.instructions.as_deref(),
            max_retries,
        )?;
        attempts_total += attempts;
        summaries.push(summary);
    }

    Ok(PendingCompression {
        summary_text: summaries.join("\n\n"),
        from_hash,
        to_hash,
        subsumed: compressible.iter().map(|c| c.row.commit_hash.clone()).collect(),
        pinned,
        expected_head: options.expected_head.clone(),
        attempts: attempts_total,
    })
}

/// Write a planned compression: one summary commit, then a skip annotation
/// per subsumed commit naming the summary.
pub fn commit_compression(
    storage: &dyn Storage,
    engine: &CommitEngine<'_>,
    budget: &BudgetGuard<'_>,
    tract_id: &str,
    pending: &PendingCompression,
) -> Result<CommitInfo> {
    if let Some(expected) = &pending.expected_head {
        let current = storage.refs().get_head(tract_id)?;
        if current.as_deref() != Some(expected.as_str()) {
            return Err(TractError::Compression("HEAD moved".to_string()));
        }
    }

    let metadata = serde_json::json!({
        "compression": {
            "from": pending.from_hash,
            "to": pending.to_hash,
            "subsumed": pending.subsumed,
        }
    });
    let info = engine.create_commit(
        tract_id,
        &Content::summary(pending.summary_text.clone()).to_value(),
        CommitParams {
            message: Some(format!(
                "compress {} commits into a summary",
                pending.subsumed.len()
            )),
            metadata: Some(metadata),
            ..Default::default()
        },
        budget,
    )?;

    for hash in &pending.subsumed {
        storage.annotations().save(NewAnnotation {
            tract_id: tract_id.to_string(),
            target_hash: hash.clone(),
            priority: Priority::Skip,
            reason: Some(format!("compressed into {}", info.commit_hash)),
            retention: None,
            created_at: engine.clock().next(),
        })?;
    }
    Ok(info)
}

/// Chronological batches bounded by a token target (stored counts) or a
/// fixed size.
fn group_by_budget(
    items: &[Compressible],
    target_tokens: Option<u64>,
    group_size: usize,
) -> Vec<&[Compressible]> {
    let mut groups = Vec::new();
    let mut start = 0usize;
    let mut tokens = 0u64;
    for (index, item) in items.iter().enumerate() {
        let over = match target_tokens {
            Some(target) => index > start && tokens + item.row.token_count > target,
            None => index - start >= group_size.max(1),
        };
        if over {
            groups.push(&items[start..index]);
            start = index;
            tokens = 0;
        }
        tokens += item.row.token_count;
    }
    if start < items.len() {
        groups.push(&items[start..]);
    }
    groups
}

/// Summarize one batch, steering on retention failures. Returns the
/// accepted summary and the attempts consumed.
fn summarize_group(
    client: &dyn LLMClient,
    group: &[Compressible],
    instructions: Option<&str>,
    max_retries: u32,
) -> Result<(String, u32)> {
    let mut system = String::from(SUMMARY_PROMPT);
    if let Some(extra) = instructions {
        system.push_str("\n\n");
        system.push_str(extra);
    }
    let retention_notes: Vec<&str> = group
        .iter()
        .filter(|item| item.priority == Priority::Important)
        .filter_map(|item| item.retention.as_ref())
        .filter_map(|retention| retention.instructions.as_deref())
        .collect();
    if !retention_notes.is_empty() {
        system.push_str("\n\nCritical retention requirements:\n");
        for note in retention_notes {
            system.push_str("- ");
            system.push_str(note);
            system.push('\n');
        }
    }

    let transcript = group
        .iter()
        .map(|item| format!("{}: {}", item.role, item.text))
        .collect::<Vec<_>>()
        .join("\n\n");

    // prompt state is shared between the attempt and the steering hook
    let messages = std::cell::RefCell::new(vec![
        ChatMessage::new("system", system),
        ChatMessage::new("user", transcript),
    ]);

    let outcome = retry_with_steering(
        &RetryControls::new(max_retries),
        |_| {
            let response = client.chat(&messages.borrow(), &ChatOptions::default())?;
            Ok(response.text)
        },
        |summary| validate_retention(summary, group),
        |diagnosis| {
            messages.borrow_mut().push(ChatMessage::new(
                "user",
                format!("The previous summary was rejected: {diagnosis}. Rewrite it and fix this."),
            ));
            Ok(())
        },
        || Ok(None),
        |_| Ok(()),
    )?;
    Ok((outcome.value, outcome.attempts))
}

/// Check a summary against every IMPORTANT commit's retention patterns.
/// Returns a diagnosis naming what is missing.
fn validate_retention(summary: &str, group: &[Compressible]) -> Result<Option<String>> {
    let mut missing: Vec<String> = Vec::new();
    for item in group.iter().filter(|item| item.priority == Priority::Important) {
        let Some(retention) = &item.retention else {
            continue;
        };
        for pattern in &retention.match_patterns {
            let found = match retention.match_mode {
                MatchMode::Substring => summary.contains(pattern.as_str()),
                MatchMode::Regex => Regex::new(pattern)
                    .map_err(|e| {
                        TractError::InvalidArgument(format!("invalid retention pattern: {e}"))
                    })?
                    .is_match(summary),
            };
            if !found {
                missing.push(pattern.clone());
            }
        }
    }
    if missing.is_empty() {
        Ok(None)
    } else {
        Ok(Some(format!(
            "summary does not preserve required content: {}",
            missing.join(", ")
        )))
    }
}
