//! Message-level diff between two compiled positions.
//!
//! Both commits are compiled to message lists, each message serialized to a
//! stable textual form, and the two sequences aligned by
//! longest-common-subsequence. Replacements additionally carry a unified
//! text diff of the two serializations.

use similar::{Algorithm, DiffOp, TextDiff, capture_diff_slices};

use crate::engine::compile::{CompileOptions, CompiledContext, Compiler};
use crate::errors::Result;
use crate::model::{GenerationConfig, Operation};
use crate::ops::navigate::resolve_commit;
use crate::storage::Storage;

/// Alignment status of one diff entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffStatus {
    Equal,
    Insert,
    Delete,
    Replace,
}

/// One aligned position of the message diff.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDiff {
    pub status: DiffStatus,
    /// Serialized message on the `a` side, absent for inserts.
    pub old: Option<String>,
    /// Serialized message on the `b` side, absent for deletes.
    pub new: Option<String>,
    /// Unified text diff of the two serializations, for replacements.
    pub text_diff: Option<String>,
}

/// Aggregate output of [`diff`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DiffResult {
    pub entries: Vec<MessageDiff>,
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
    /// `b` tokens minus `a` tokens.
    pub token_delta: i64,
    /// Per-field `(name, old, new)` generation-config changes between the
    /// two commits.
    pub config_changes: Vec<(String, serde_json::Value, serde_json::Value)>,
}

/// Serialize one message for comparison.
fn serialize_message(role: &str, content: &str) -> String {
    format!("role: {role}\n---\n{content}")
}

fn serialized(context: &CompiledContext) -> Vec<String> {
    context
        .messages
        .iter()
        .map(|m| serialize_message(&m.role, &m.content))
        .collect()
}

/// Resolve the implicit `a` side: an EDIT commit diffs against its target,
/// anything else against its parent.
pub fn implicit_base(storage: &dyn Storage, commit_b: &str) -> Result<Option<String>> {
    let Some(row) = storage.commits().get(commit_b)? else {
        return Ok(None);
    };
    if row.operation == Operation::Edit {
        if let Some(target) = row.edit_target {
            return Ok(Some(target));
        }
    }
    Ok(row.parent_hash)
}

/// Diff the compiled output of two commits. `commit_a = None` compares
/// against the empty context.
pub fn diff(
    storage: &dyn Storage,
    compiler: &Compiler<'_>,
    tract_id: &str,
    commit_a: Option<&str>,
    commit_b: &str,
) -> Result<DiffResult> {
    let b_hash = resolve_commit(storage, tract_id, commit_b)?;
    let a_hash = match commit_a {
        Some(target) => Some(resolve_commit(storage, tract_id, target)?),
        None => None,
    };

    let options = CompileOptions::default();
    let context_a = compiler.compile(tract_id, a_hash.as_deref(), &options)?;
    let context_b = compiler.compile(tract_id, Some(&b_hash), &options)?;

    let lines_a = serialized(&context_a);
    let lines_b = serialized(&context_b);
    let ops = capture_diff_slices(Algorithm::Myers, &lines_a, &lines_b);

    let mut result = DiffResult {
        token_delta: context_b.token_count as i64 - context_a.token_count as i64,
        ..DiffResult::default()
    };
    for op in ops {
        match op {
            DiffOp::Equal {
                old_index,
                new_index,
                len,
            } => {
                for offset in 0..len {
                    result.entries.push(MessageDiff {
                        status: DiffStatus::Equal,
                        old: Some(lines_a[old_index + offset].clone()),
                        new: Some(lines_b[new_index + offset].clone()),
                        text_diff: None,
                    });
                }
            }
            DiffOp::Delete {
                old_index, old_len, ..
            } => {
                for offset in 0..old_len {
                    result.removed += 1;
                    result.entries.push(MessageDiff {
                        status: DiffStatus::Delete,
                        old: Some(lines_a[old_index + offset].clone()),
                        new: None,
                        text_diff: None,
                    });
                }
            }
            DiffOp::Insert {
                new_index, new_len, ..
            } => {
                for offset in 0..new_len {
                    result.added += 1;
                    result.entries.push(MessageDiff {
                        status: DiffStatus::Insert,
                        old: None,
                        new: Some(lines_b[new_index + offset].clone()),
                        text_diff: None,
                    });
                }
            }
            DiffOp::Replace {
                old_index,
                old_len,
                new_index,
                new_len,
            } => {
                let paired = old_len.min(new_len);
                for offset in 0..paired {
                    let old = &lines_a[old_index + offset];
                    let new = &lines_b[new_index + offset];
                    result.modified += 1;
                    result.entries.push(MessageDiff {
                        status: DiffStatus::Replace,
                        old: Some(old.clone()),
                        new: Some(new.clone()),
                        text_diff: Some(unified(old, new)),
                    });
                }
                for offset in paired..old_len {
                    result.removed += 1;
                    result.entries.push(MessageDiff {
                        status: DiffStatus::Delete,
                        old: Some(lines_a[old_index + offset].clone()),
                        new: None,
                        text_diff: None,
                    });
                }
                for offset in paired..new_len {
                    result.added += 1;
                    result.entries.push(MessageDiff {
                        status: DiffStatus::Insert,
                        old: None,
                        new: Some(lines_b[new_index + offset].clone()),
                        text_diff: None,
                    });
                }
            }
        }
    }

    result.config_changes = config_changes(storage, a_hash.as_deref(), &b_hash)?;
    Ok(result)
}

fn config_changes(
    storage: &dyn Storage,
    a_hash: Option<&str>,
    b_hash: &str,
) -> Result<Vec<(String, serde_json::Value, serde_json::Value)>> {
    let config_of = |hash: Option<&str>| -> Result<GenerationConfig> {
        let Some(hash) = hash else {
            return Ok(GenerationConfig::default());
        };
        Ok(storage
            .commits()
            .get(hash)?
            .and_then(|row| row.generation_config)
            .unwrap_or_default())
    };
    let a = config_of(a_hash)?;
    let b = config_of(Some(b_hash))?;
    Ok(a.field_changes(&b))
}

fn unified(old: &str, new: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(2)
        .header("a", "b")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_message_shape() {
        assert_eq!(serialize_message("user", "hi"), "role: user\n---\nhi");
    }

    #[test]
    fn test_unified_diff_marks_changed_line() {
        let out = unified("role: user\n---\nHi", "role: user\n---\nHi, world!");
        assert!(out.contains("-Hi"));
        assert!(out.contains("+Hi, world!"));
    }
}
