//! Commit resolution and HEAD movement: reset, checkout, branch management.

use crate::errors::{Result, TractError};
use crate::hash::{HASH_HEX_LEN, MIN_PREFIX_LEN};
use crate::model::{CommitInfo, ORIG_HEAD, PREV_HEAD};
use crate::storage::Storage;

/// Reset flavour. The two are indistinguishable at the storage level (there
/// is no working tree); `Hard` signals an external collector that commits
/// made unreachable by this reset are eligible for earlier reclamation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetMode {
    #[default]
    Soft,
    Hard,
}

/// Resolve a ref or hash prefix to a full commit hash.
///
/// Tried in order: exact full-hash match, branch name, `HEAD`, then a hash
/// prefix of at least four characters. A prefix matching more than one
/// commit fails with up to five candidates.
pub fn resolve_commit(storage: &dyn Storage, tract_id: &str, target: &str) -> Result<String> {
    if target.len() == HASH_HEX_LEN {
        if let Some(row) = storage.commits().get(target)? {
            return Ok(row.commit_hash);
        }
    }
    if let Some(tip) = storage.refs().get_branch(tract_id, target)? {
        return Ok(tip);
    }
    // named refs: HEAD, ORIG_HEAD, PREV_HEAD
    if let Some(record) = storage.refs().get_ref(tract_id, target)? {
        if let Some(hash) = record.commit_hash {
            return Ok(hash);
        }
        if record.symbolic_target.is_some() {
            return storage
                .refs()
                .get_head(tract_id)?
                .ok_or_else(|| TractError::CommitNotFound(target.to_string()));
        }
        return Err(TractError::CommitNotFound(target.to_string()));
    }
    if target.len() < MIN_PREFIX_LEN {
        return Err(TractError::InvalidArgument(format!(
            "`{target}` is not a branch, and hash prefixes need at least {MIN_PREFIX_LEN} characters"
        )));
    }
    storage
        .commits()
        .get_by_prefix(target, Some(tract_id))?
        .map(|row| row.commit_hash)
        .ok_or_else(|| TractError::CommitNotFound(target.to_string()))
}

/// Move HEAD to `target`, saving the old position to `ORIG_HEAD` and
/// `PREV_HEAD` first. Follows the symbolic path: a reset on an attached
/// HEAD moves the branch.
pub fn reset(
    storage: &dyn Storage,
    tract_id: &str,
    target: &str,
    mode: ResetMode,
) -> Result<String> {
    let resolved = resolve_commit(storage, tract_id, target)?;
    if let Some(old) = storage.refs().get_head(tract_id)? {
        storage.refs().set_ref(tract_id, ORIG_HEAD, Some(&old))?;
        storage.refs().set_ref(tract_id, PREV_HEAD, Some(&old))?;
    }
    storage.refs().update_head(tract_id, &resolved)?;
    if mode == ResetMode::Hard {
        tracing::debug!(
            tract = %tract_id,
            to = %resolved,
            "hard reset: unreachable commits are eligible for early reclamation"
        );
    }
    Ok(resolved)
}

/// Where a checkout landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutOutcome {
    pub commit_hash: String,
    /// The branch HEAD attached to, or `None` when HEAD detached.
    pub branch: Option<String>,
}

/// Check out a branch, a commit, or `"-"` (the previous position).
///
/// Attaches HEAD when `target` names a branch, detaches it at the resolved
/// commit otherwise. The previous position is saved to `PREV_HEAD`; for
/// `"-"` it is read *before* being overwritten.
pub fn checkout(storage: &dyn Storage, tract_id: &str, target: &str) -> Result<CheckoutOutcome> {
    let old_head = storage.refs().get_head(tract_id)?;

    // `-` resolves against the position about to be overwritten.
    let effective: String = if target == "-" {
        storage
            .refs()
            .get_ref(tract_id, PREV_HEAD)?
            .and_then(|r| r.commit_hash)
            .ok_or_else(|| {
                TractError::InvalidArgument(
                    "no previous position: nothing has been checked out yet".to_string(),
                )
            })?
    } else {
        target.to_string()
    };

    let outcome = if let Some(tip) = storage.refs().get_branch(tract_id, &effective)? {
        storage.refs().attach_head(tract_id, &effective)?;
        CheckoutOutcome {
            commit_hash: tip,
            branch: Some(effective),
        }
    } else {
        let resolved = resolve_commit(storage, tract_id, &effective)?;
        storage.refs().detach_head(tract_id, &resolved)?;
        CheckoutOutcome {
            commit_hash: resolved,
            branch: None,
        }
    };

    if let Some(old) = old_head {
        storage.refs().set_ref(tract_id, PREV_HEAD, Some(&old))?;
    }
    Ok(outcome)
}

/// Create a branch at `at` (or the current HEAD). Refuses to clobber an
/// existing branch.
pub fn create_branch(
    storage: &dyn Storage,
    tract_id: &str,
    name: &str,
    at: Option<&str>,
) -> Result<String> {
    if storage.refs().get_branch(tract_id, name)?.is_some() {
        return Err(TractError::InvalidArgument(format!(
            "branch `{name}` already exists"
        )));
    }
    let position = match at {
        Some(target) => resolve_commit(storage, tract_id, target)?,
        None => storage.refs().get_head(tract_id)?.ok_or_else(|| {
            TractError::InvalidArgument("cannot branch from an empty history".to_string())
        })?,
    };
    storage.refs().set_branch(tract_id, name, &position)?;
    Ok(position)
}

/// Delete a branch. The branch HEAD is attached to cannot be deleted.
pub fn delete_branch(storage: &dyn Storage, tract_id: &str, name: &str) -> Result<()> {
    if storage.refs().head_branch(tract_id)?.as_deref() == Some(name) {
        return Err(TractError::InvalidArgument(format!(
            "cannot delete `{name}`: HEAD points at it"
        )));
    }
    if !storage.refs().delete_branch(tract_id, name)? {
        return Err(TractError::CommitNotFound(format!("branch `{name}`")));
    }
    Ok(())
}

/// Head-first history along primary parents.
pub fn log(storage: &dyn Storage, tract_id: &str, limit: Option<usize>) -> Result<Vec<CommitInfo>> {
    let Some(head) = storage.refs().get_head(tract_id)? else {
        return Ok(Vec::new());
    };
    Ok(storage
        .commits()
        .get_ancestors(&head, limit)?
        .iter()
        .map(CommitInfo::from)
        .collect())
}
