//! Persisted record shapes for the context store.
//!
//! Everything here is write-once except [`RefRecord`]: blobs, commits,
//! parent edges, annotations, and tool-schema rows are immutable once
//! stored. Refs are the only mutable records in the system.
//!
//! Identity rules live in [`crate::hash`]; these types only carry data and
//! the invariants that can be expressed structurally.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{Result, TractError};

/// Name of the primary mutable ref.
pub const HEAD: &str = "HEAD";
/// Ref holding the pre-reset HEAD, for recovery.
pub const ORIG_HEAD: &str = "ORIG_HEAD";
/// Ref holding the previous HEAD position, saved before every checkout or
/// reset; enables `checkout("-")`.
pub const PREV_HEAD: &str = "PREV_HEAD";
/// Namespace prefix for branch refs.
pub const BRANCH_PREFIX: &str = "refs/heads/";

/// Fully qualified ref name for a branch.
pub fn branch_ref(name: &str) -> String {
    format!("{BRANCH_PREFIX}{name}")
}

/// Retention priority of a commit within compiled output and compression.
///
/// Ordering is semantic: `Skip < Normal < Important < Pinned`. A commit's
/// current priority is the latest annotation targeting it, falling back to
/// its content type's default.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Excluded from compiled output entirely.
    Skip,
    /// Ordinary conversational content; compressible.
    #[default]
    Normal,
    /// Compressible only under retention criteria.
    Important,
    /// Never compressed; passes through summaries verbatim.
    Pinned,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Skip => "skip",
            Priority::Normal => "normal",
            Priority::Important => "important",
            Priority::Pinned => "pinned",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commit operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Appends new content at the tip of the chain.
    #[default]
    Append,
    /// Replaces the effective content at an earlier `append` commit's
    /// position. One level of indirection only: editing an edit is
    /// forbidden.
    Edit,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Append => "append",
            Operation::Edit => "edit",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How `match_patterns` are applied to a summary during retention
/// validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    Substring,
    Regex,
}

/// Retention criteria attached to an IMPORTANT annotation: natural-language
/// guidance injected into the summarization prompt, plus deterministic
/// patterns the produced summary must satisfy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RetentionCriteria {
    /// Free-form instructions for the summarizer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// Patterns the summary text must contain (or match, under `Regex`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_patterns: Vec<String>,
    #[serde(default)]
    pub match_mode: MatchMode,
}

/// Immutable, content-addressed JSON payload.
///
/// Primary key is `content_hash = SHA-256(canonical_json(payload))`; blobs
/// are globally deduplicated by hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobRecord {
    pub content_hash: String,
    pub payload: Value,
    pub byte_size: usize,
    pub token_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Immutable commit row binding a blob to a parent chain.
///
/// Fields contributing to `commit_hash`: `content_hash`, `parent_hash`,
/// the sorted extra parents (edge table), `content_type`, `operation`, the
/// identity timestamp, and `edit_target`. `message`, `metadata`,
/// `token_count`, `tract_id`, and `generation_config` are not part of
/// identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub commit_hash: String,
    pub tract_id: String,
    /// `None` only for a root commit.
    pub parent_hash: Option<String>,
    pub content_hash: String,
    pub content_type: String,
    pub operation: Operation,
    /// Target of an `edit` commit; always an `append` in the same tract.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub token_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    pub created_at: DateTime<Utc>,
}

impl CommitRecord {
    /// The ISO-8601 identity timestamp, as hashed into `commit_hash`.
    pub fn timestamp_iso(&self) -> String {
        timestamp_iso(self.created_at)
    }
}

/// Render a timestamp in the fixed format used for commit identity.
pub fn timestamp_iso(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Append-only priority annotation. The latest annotation (by `created_at`,
/// then by id) for a target is its current priority; history is never
/// rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRecord {
    /// Monotonic per-store id; assigned by the backend.
    pub id: u64,
    pub tract_id: String,
    pub target_hash: String,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Only meaningful when `priority` is [`Priority::Important`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<RetentionCriteria>,
    pub created_at: DateTime<Utc>,
}

/// Named mutable pointer, composite-keyed by `(tract_id, ref_name)`.
///
/// Exactly one of `commit_hash` and `symbolic_target` is set, except for an
/// uninitialised HEAD where both may be `None`. HEAD is detached iff
/// `symbolic_target` is `None` while `commit_hash` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefRecord {
    pub tract_id: String,
    pub ref_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbolic_target: Option<String>,
}

/// Extra-parent edge of a merge commit. `position` 0 is the primary parent
/// (also mirrored on the commit row for fast single-parent lookups); merge
/// parents start at position 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitParentRecord {
    pub commit_hash: String,
    pub parent_hash: String,
    pub position: u32,
}

/// Content-addressed tool schema row. Tool schemas are provenance, not
/// conversational content; they surface on compiled output as a separate
/// field, never as messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchemaRecord {
    pub content_hash: String,
    pub name: String,
    pub schema: Value,
    pub created_at: DateTime<Utc>,
}

/// Per-commit LLM request parameters, recorded for provenance and replayed
/// on diff output. Unknown provider-specific keys land in `extra`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(
        default,
        alias = "max_output_tokens",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl GenerationConfig {
    pub fn is_empty(&self) -> bool {
        self == &GenerationConfig::default()
    }

    /// Serialize to a JSON object (aliases canonicalised to `max_tokens`).
    pub fn to_value(&self) -> Value {
        // Serialization of a plain struct cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Parse from a JSON object, accepting input aliases.
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone()).map_err(TractError::from)
    }

    /// Per-field `(name, old, new)` differences against another config.
    pub fn field_changes(&self, other: &GenerationConfig) -> Vec<(String, Value, Value)> {
        let (a, b) = (self.to_value(), other.to_value());
        let empty = serde_json::Map::new();
        let a_map = a.as_object().unwrap_or(&empty);
        let b_map = b.as_object().unwrap_or(&empty);
        let mut keys: Vec<&String> = a_map.keys().chain(b_map.keys()).collect();
        keys.sort();
        keys.dedup();
        keys.into_iter()
            .filter_map(|k| {
                let old = a_map.get(k).cloned().unwrap_or(Value::Null);
                let new = b_map.get(k).cloned().unwrap_or(Value::Null);
                (old != new).then(|| (k.clone(), old, new))
            })
            .collect()
    }
}

/// Write-path DTO returned by commit creation and history listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub commit_hash: String,
    pub parent_hash: Option<String>,
    pub content_type: String,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_target: Option<String>,
    pub token_count: u64,
    pub created_at: DateTime<Utc>,
}

impl From<&CommitRecord> for CommitInfo {
    fn from(row: &CommitRecord) -> Self {
        CommitInfo {
            commit_hash: row.commit_hash.clone(),
            parent_hash: row.parent_hash.clone(),
            content_type: row.content_type.clone(),
            operation: row.operation,
            message: row.message.clone(),
            edit_target: row.edit_target.clone(),
            token_count: row.token_count,
            created_at: row.created_at,
        }
    }
}
