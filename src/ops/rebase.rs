//! Rebase and cherry-pick: replaying commits onto a new parent chain.
//!
//! Replaying a commit keeps its blob (content hash unchanged) and mints a
//! new commit hash from the new parent and a fresh timestamp; the originals
//! remain in history. Safety checks run before any write: an edit whose
//! target would vanish from the new ancestry is a hard violation, and a
//! commit whose effective priority was annotated away from its type default
//! is a warning (annotations do not follow replayed hashes). Without a
//! resolver the first issue aborts; with one, each issue is presented for
//! resolution.

use std::collections::{HashMap, HashSet};

use crate::engine::commit::{BudgetGuard, CommitEngine, CommitParams};
use crate::errors::{Result, TractError};
use crate::llm::{RebaseWarning, ResolutionAction, Resolver, ResolverIssue};
use crate::model::{CommitInfo, CommitRecord, Operation, ORIG_HEAD, PREV_HEAD};
use crate::ops::navigate::resolve_commit;
use crate::storage::{NewAnnotation, Storage, reachable_set, topological_order};

#[derive(Debug, Clone, PartialEq)]
pub struct RebaseOutcome {
    pub new_head: String,
    /// Old hash -> replayed hash, in replay order.
    pub replayed: Vec<(String, String)>,
    /// Commits dropped by resolver decision.
    pub skipped: Vec<String>,
}

enum PlanStep {
    Replay,
    Skip,
}

/// Replay the current branch's unique commits onto `onto`.
pub fn rebase(
    storage: &dyn Storage,
    engine: &CommitEngine<'_>,
    budget: &BudgetGuard<'_>,
    tract_id: &str,
    onto: &str,
    mut resolver: Option<&mut dyn Resolver>,
) -> Result<RebaseOutcome> {
    let current = storage.refs().get_head(tract_id)?.ok_or_else(|| {
        TractError::InvalidArgument("nothing to rebase: empty HEAD".to_string())
    })?;
    let onto_hash = resolve_commit(storage, tract_id, onto)?;
    let onto_reach = reachable_set(storage, &onto_hash)?;

    if onto_reach.contains(&current) {
        // already an ancestor of the target: fast-forward the branch
        storage.refs().set_ref(tract_id, ORIG_HEAD, Some(&current))?;
        storage.refs().set_ref(tract_id, PREV_HEAD, Some(&current))?;
        storage.refs().update_head(tract_id, &onto_hash)?;
        return Ok(RebaseOutcome {
            new_head: onto_hash,
            replayed: Vec::new(),
            skipped: Vec::new(),
        });
    }

    let current_order = topological_order(storage, &current)?;
    // already based on the target: nothing to replay
    if current_order.iter().any(|row| row.commit_hash == onto_hash) {
        return Ok(RebaseOutcome {
            new_head: current,
            replayed: Vec::new(),
            skipped: Vec::new(),
        });
    }
    let to_replay: Vec<CommitRecord> = current_order
        .into_iter()
        .filter(|row| !onto_reach.contains(&row.commit_hash))
        .collect();
    if to_replay.is_empty() {
        return Ok(RebaseOutcome {
            new_head: current,
            replayed: Vec::new(),
            skipped: Vec::new(),
        });
    }

    // plan before writing: consult the resolver on every safety issue
    let mut plan: Vec<(CommitRecord, PlanStep)> = Vec::new();
    let mut will_replay: HashSet<String> = HashSet::new();
    for row in to_replay {
        let issue = safety_issue(storage, engine, &row, &onto_reach, &will_replay)?;
        let step = match issue {
            None => PlanStep::Replay,
            Some(reason) => match resolver.as_deref_mut() {
                None => {
                    return Err(TractError::SemanticSafety {
                        commit: row.commit_hash.clone(),
                        reason,
                    });
                }
                Some(resolver) => {
                    let warning = RebaseWarning {
                        commit_hash: row.commit_hash.clone(),
                        reason: reason.clone(),
                    };
                    let resolution = resolver.resolve(&ResolverIssue::Rebase(warning))?;
                    match resolution.action {
                        ResolutionAction::Abort => {
                            return Err(TractError::SemanticSafety {
                                commit: row.commit_hash.clone(),
                                reason: resolution.reasoning.unwrap_or(reason),
                            });
                        }
                        ResolutionAction::Skip => PlanStep::Skip,
                        ResolutionAction::Resolved => {
                            if orphan_edit(&row, &onto_reach, &will_replay) {
                                tracing::warn!(
                                    commit = %row.commit_hash,
                                    "edit target absent from new ancestry; dropping despite resolution"
                                );
                                PlanStep::Skip
                            } else {
                                PlanStep::Replay
                            }
                        }
                    }
                }
            },
        };
        if matches!(step, PlanStep::Replay) {
            will_replay.insert(row.commit_hash.clone());
        }
        plan.push((row, step));
    }

    // execute: move to the new base, then replay in order
    storage.refs().set_ref(tract_id, ORIG_HEAD, Some(&current))?;
    storage.refs().set_ref(tract_id, PREV_HEAD, Some(&current))?;
    storage.refs().update_head(tract_id, &onto_hash)?;

    let mut rewritten: HashMap<String, String> = HashMap::new();
    let mut replayed = Vec::new();
    let mut skipped = Vec::new();
    let mut new_head = onto_hash.clone();
    for (row, step) in plan {
        match step {
            PlanStep::Skip => skipped.push(row.commit_hash),
            PlanStep::Replay => {
                // edits of commits replayed earlier in this pass follow the
                // rewritten hash
                let edit_target = row.edit_target.clone().map(|target| {
                    rewritten.get(&target).cloned().unwrap_or(target)
                });
                let info = replay(storage, engine, budget, tract_id, &row, edit_target)?;
                carry_annotation(storage, engine, tract_id, &row.commit_hash, &info)?;
                rewritten.insert(row.commit_hash.clone(), info.commit_hash.clone());
                new_head = info.commit_hash.clone();
                replayed.push((row.commit_hash, info.commit_hash));
            }
        }
    }

    Ok(RebaseOutcome {
        new_head,
        replayed,
        skipped,
    })
}

/// Replay a single commit onto the current HEAD.
///
/// Edits may only be cherry-picked when their target is an ancestor of the
/// current HEAD; anything else would orphan the edit.
pub fn cherry_pick(
    storage: &dyn Storage,
    engine: &CommitEngine<'_>,
    budget: &BudgetGuard<'_>,
    tract_id: &str,
    target: &str,
) -> Result<CommitInfo> {
    let hash = resolve_commit(storage, tract_id, target)?;
    let row = storage
        .commits()
        .get(&hash)?
        .ok_or_else(|| TractError::CommitNotFound(hash.clone()))?;

    if row.operation == Operation::Edit {
        let head = storage.refs().get_head(tract_id)?.ok_or_else(|| {
            TractError::InvalidArgument("cannot cherry-pick onto an empty history".to_string())
        })?;
        let reach = reachable_set(storage, &head)?;
        let target_ok = row
            .edit_target
            .as_ref()
            .is_some_and(|target| reach.contains(target));
        if !target_ok {
            return Err(TractError::CherryPick {
                commit: row.commit_hash.clone(),
                reason: "edit target is not an ancestor of HEAD".to_string(),
            });
        }
    }

    let edit_target = row.edit_target.clone();
    replay(storage, engine, budget, tract_id, &row, edit_target)
}

/// The replay contract: same blob, same optional fields, new parent chain,
/// new timestamp, new hash. The original commit stays in history.
fn replay(
    storage: &dyn Storage,
    engine: &CommitEngine<'_>,
    budget: &BudgetGuard<'_>,
    tract_id: &str,
    row: &CommitRecord,
    edit_target: Option<String>,
) -> Result<CommitInfo> {
    let blob = storage
        .blobs()
        .get(&row.content_hash)?
        .ok_or_else(|| TractError::storage(format!("missing blob {}", row.content_hash)))?;
    engine.create_commit(
        tract_id,
        &blob.payload,
        CommitParams {
            operation: row.operation,
            message: row.message.clone(),
            edit_target,
            metadata: row.metadata.clone(),
            generation_config: row.generation_config.clone(),
            ..Default::default()
        },
        budget,
    )
}

/// Issue description for a commit about to be replayed, if any.
fn safety_issue(
    storage: &dyn Storage,
    engine: &CommitEngine<'_>,
    row: &CommitRecord,
    onto_reach: &HashSet<String>,
    will_replay: &HashSet<String>,
) -> Result<Option<String>> {
    if orphan_edit(row, onto_reach, will_replay) {
        return Ok(Some(
            "edit target does not exist in the new ancestry".to_string(),
        ));
    }
    // annotations are keyed by hash and will not follow the replayed commit
    let latest = storage
        .annotations()
        .batch_get_latest(&[row.commit_hash.clone()], None)?;
    if let Some(annotation) = latest.get(&row.commit_hash) {
        let default = engine.registry().hints_for(&row.content_type).default_priority;
        if annotation.priority != default {
            return Ok(Some(format!(
                "effective priority {} differs from the {} default and would be lost",
                annotation.priority, row.content_type
            )));
        }
    }
    Ok(None)
}

fn orphan_edit(
    row: &CommitRecord,
    onto_reach: &HashSet<String>,
    will_replay: &HashSet<String>,
) -> bool {
    if row.operation != Operation::Edit {
        return false;
    }
    match &row.edit_target {
        Some(target) => !onto_reach.contains(target) && !will_replay.contains(target),
        None => true,
    }
}

/// Copy the original's latest annotation onto the replayed commit, keeping
/// its effective priority across the rewrite.
fn carry_annotation(
    storage: &dyn Storage,
    engine: &CommitEngine<'_>,
    tract_id: &str,
    original: &str,
    replayed: &CommitInfo,
) -> Result<()> {
    let latest = storage
        .annotations()
        .batch_get_latest(&[original.to_string()], None)?;
    if let Some(annotation) = latest.get(original) {
        storage.annotations().save(NewAnnotation {
            tract_id: tract_id.to_string(),
            target_hash: replayed.commit_hash.clone(),
            priority: annotation.priority,
            reason: Some(format!("carried from {original} during rebase")),
            retention: annotation.retention.clone(),
            created_at: engine.clock().next(),
        })?;
    }
    Ok(())
}
