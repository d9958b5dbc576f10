//! Merging divergent histories: merge-base discovery, fast-forward,
//! structural conflict detection, and semantic (resolver-mediated) merges.
//!
//! A clean merge writes one marker commit with both parents. A semantic
//! merge first writes one EDIT commit per resolved conflict (so the
//! compiler's latest-edit-wins rule surfaces the resolution at the
//! conflicted position), then the marker commit. Conflicted merges without
//! a resolver return the conflict set and write nothing.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::content::Content;
use crate::engine::commit::{BudgetGuard, CommitEngine, CommitParams};
use crate::errors::{Result, TractError};
use crate::llm::{ConflictInfo, ConflictKind, Resolution, ResolutionAction, Resolver, ResolverIssue};
use crate::model::{CommitRecord, Operation, Priority};
use crate::ops::navigate::resolve_commit;
use crate::storage::{NewAnnotation, Storage, reachable_commits};

/// How conflicts are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// Structural only; conflicts are returned unresolved.
    #[default]
    Auto,
    /// Conflicts are delegated to the resolver.
    Semantic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStatus {
    /// The source was already contained in the current history.
    UpToDate,
    /// The current branch moved forward to the source head; no new commit.
    FastForward,
    /// A merge commit with both parents was written.
    Merged,
    /// Structural conflicts; nothing was written.
    Conflicted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub status: MergeStatus,
    /// The resulting head for `FastForward`/`Merged`.
    pub commit: Option<String>,
    pub conflicts: Vec<ConflictInfo>,
}

/// Most recent common ancestor of two commits, deterministic by
/// `(created_at, commit_hash)`.
pub fn find_merge_base(storage: &dyn Storage, a: &str, b: &str) -> Result<Option<String>> {
    let ours = reachable_commits(storage, a)?;
    let theirs: HashSet<String> = reachable_commits(storage, b)?
        .into_iter()
        .map(|row| row.commit_hash)
        .collect();
    Ok(ours
        .into_iter()
        .filter(|row| theirs.contains(&row.commit_hash))
        .max_by(|x, y| (x.created_at, &x.commit_hash).cmp(&(y.created_at, &y.commit_hash)))
        .map(|row| row.commit_hash))
}

/// Merge `source` (branch or committish) into the current HEAD.
pub fn merge(
    storage: &dyn Storage,
    engine: &CommitEngine<'_>,
    budget: &BudgetGuard<'_>,
    tract_id: &str,
    source: &str,
    strategy: MergeStrategy,
    mut resolver: Option<&mut dyn Resolver>,
) -> Result<MergeOutcome> {
    let current = storage
        .refs()
        .get_head(tract_id)?
        .ok_or_else(|| TractError::InvalidArgument("nothing to merge into: empty HEAD".to_string()))?;
    let source_head = resolve_commit(storage, tract_id, source)?;

    if source_head == current {
        return Ok(up_to_date());
    }
    let base = find_merge_base(storage, &current, &source_head)?;
    if base.as_deref() == Some(source_head.as_str()) {
        // merging an ancestor produces no commit
        return Ok(up_to_date());
    }
    if base.as_deref() == Some(current.as_str()) {
        storage.refs().update_head(tract_id, &source_head)?;
        return Ok(MergeOutcome {
            status: MergeStatus::FastForward,
            commit: Some(source_head),
            conflicts: Vec::new(),
        });
    }

    // divergent: partition the two sides' unique commits
    let ours_reach: HashSet<String> = reachable_commits(storage, &current)?
        .into_iter()
        .map(|row| row.commit_hash)
        .collect();
    let theirs_rows = reachable_commits(storage, &source_head)?;
    let theirs_reach: HashSet<String> = theirs_rows
        .iter()
        .map(|row| row.commit_hash.clone())
        .collect();
    let ours_unique: Vec<CommitRecord> = reachable_commits(storage, &current)?
        .into_iter()
        .filter(|row| !theirs_reach.contains(&row.commit_hash))
        .collect();
    let theirs_unique: Vec<CommitRecord> = theirs_rows
        .into_iter()
        .filter(|row| !ours_reach.contains(&row.commit_hash))
        .collect();

    let conflicts = detect_conflicts(storage, &ours_unique, &theirs_unique)?;

    let semantic = strategy == MergeStrategy::Semantic || resolver.is_some();
    if !conflicts.is_empty() && !semantic {
        return Ok(MergeOutcome {
            status: MergeStatus::Conflicted,
            commit: None,
            conflicts,
        });
    }

    // collect every resolution before writing anything, so an abort leaves
    // no partial state
    let mut resolved: Vec<(ConflictInfo, Resolution)> = Vec::new();
    if !conflicts.is_empty() {
        let Some(resolver) = resolver.as_deref_mut() else {
            return Err(TractError::InvalidArgument(
                "semantic merge requires a resolver".to_string(),
            ));
        };
        for conflict in conflicts {
            let resolution = resolver.resolve(&ResolverIssue::Conflict(conflict.clone()))?;
            match resolution.action {
                ResolutionAction::Abort => {
                    return Err(TractError::MergeAborted(
                        resolution
                            .reasoning
                            .unwrap_or_else(|| format!("conflict at {}", conflict.target_hash)),
                    ));
                }
                ResolutionAction::Skip => {}
                ResolutionAction::Resolved => resolved.push((conflict, resolution)),
            }
        }
    }

    // resolution edits land on our branch ahead of the merge point
    for (conflict, resolution) in &resolved {
        let Some(text) = &resolution.content_text else {
            tracing::warn!(target = %conflict.target_hash, "resolution without content; skipping");
            continue;
        };
        let target = storage
            .commits()
            .get(&conflict.target_hash)?
            .ok_or_else(|| TractError::CommitNotFound(conflict.target_hash.clone()))?;
        let blob = storage.blobs().get(&target.content_hash)?.ok_or_else(|| {
            TractError::storage(format!("missing blob {}", target.content_hash))
        })?;
        engine.create_commit(
            tract_id,
            &replace_text(&blob.payload, text),
            CommitParams {
                operation: Operation::Edit,
                edit_target: Some(conflict.target_hash.clone()),
                message: Some("resolve merge conflict".to_string()),
                generation_config: resolution.generation_config.clone(),
                ..Default::default()
            },
            budget,
        )?;
    }

    let marker = Content::instruction(format!("Merge '{source}'"));
    let info = engine.create_commit(
        tract_id,
        &marker.to_value(),
        CommitParams {
            message: Some(format!("Merge '{source}'")),
            extra_parents: vec![source_head],
            ..Default::default()
        },
        budget,
    )?;
    // the marker is bookkeeping, not conversational content; the annotation
    // must postdate the engine's pinned default for the instruction type
    storage.annotations().save(NewAnnotation {
        tract_id: tract_id.to_string(),
        target_hash: info.commit_hash.clone(),
        priority: Priority::Skip,
        reason: Some("merge marker".to_string()),
        retention: None,
        created_at: engine.clock().next(),
    })?;

    Ok(MergeOutcome {
        status: MergeStatus::Merged,
        commit: Some(info.commit_hash),
        conflicts: Vec::new(),
    })
}

fn up_to_date() -> MergeOutcome {
    MergeOutcome {
        status: MergeStatus::UpToDate,
        commit: None,
        conflicts: Vec::new(),
    }
}

/// Latest edit per target among a side's unique commits.
fn edits_by_target(rows: &[CommitRecord]) -> HashMap<String, &CommitRecord> {
    let mut map: HashMap<String, &CommitRecord> = HashMap::new();
    for row in rows {
        if row.operation != Operation::Edit {
            continue;
        }
        let Some(target) = &row.edit_target else {
            continue;
        };
        let newer = map.get(target).is_none_or(|current| {
            (row.created_at, &row.commit_hash) > (current.created_at, &current.commit_hash)
        });
        if newer {
            map.insert(target.clone(), row);
        }
    }
    map
}

/// The documented conflict enumeration: both sides editing one target, and
/// an edit of a target whose current priority is skip.
fn detect_conflicts(
    storage: &dyn Storage,
    ours: &[CommitRecord],
    theirs: &[CommitRecord],
) -> Result<Vec<ConflictInfo>> {
    let our_edits = edits_by_target(ours);
    let their_edits = edits_by_target(theirs);

    let mut conflicts = Vec::new();
    let mut contested: Vec<&String> = our_edits
        .keys()
        .filter(|target| their_edits.contains_key(*target))
        .collect();
    contested.sort();
    for target in contested {
        conflicts.push(ConflictInfo {
            kind: ConflictKind::EditEdit,
            target_hash: target.clone(),
            ours_text: blob_text(storage, our_edits[target])?,
            theirs_text: blob_text(storage, their_edits[target])?,
            detail: "both branches edited this commit".to_string(),
        });
    }

    // an edit on one side of a target the other side's history skips
    let skip_targets: Vec<String> = our_edits
        .keys()
        .chain(their_edits.keys())
        .filter(|t| !our_edits.contains_key(*t) || !their_edits.contains_key(*t))
        .cloned()
        .collect();
    if !skip_targets.is_empty() {
        let latest = storage.annotations().batch_get_latest(&skip_targets, None)?;
        for (target, annotation) in latest {
            if annotation.priority != Priority::Skip {
                continue;
            }
            let edit = our_edits.get(&target).or_else(|| their_edits.get(&target));
            if let Some(&edit) = edit {
                conflicts.push(ConflictInfo {
                    kind: ConflictKind::EditSkip,
                    target_hash: target.clone(),
                    ours_text: blob_text(storage, edit)?,
                    theirs_text: None,
                    detail: "one side edited a commit the other side skips".to_string(),
                });
            }
        }
    }
    conflicts.sort_by(|a, b| a.target_hash.cmp(&b.target_hash));
    Ok(conflicts)
}

fn blob_text(storage: &dyn Storage, row: &CommitRecord) -> Result<Option<String>> {
    Ok(storage
        .blobs()
        .get(&row.content_hash)?
        .map(|blob| crate::content::extract_text(&blob.payload)))
}

/// Clone a content body with its display text swapped for `text`, keeping
/// the discriminator so validation still passes.
pub(crate) fn replace_text(body: &Value, text: &str) -> Value {
    let mut out = body.clone();
    if let Some(obj) = out.as_object_mut() {
        if obj.get("text").is_some() {
            obj.insert("text".to_string(), Value::from(text));
        } else if obj.get("content").is_some_and(Value::is_string) {
            obj.insert("content".to_string(), Value::from(text));
        } else if obj.get("payload").is_some() {
            obj.insert("payload".to_string(), Value::from(text));
        }
    }
    out
}
