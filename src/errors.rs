//! Error types for the Tract crate.
//!
//! This module defines a unified error enumeration used across content
//! validation, the commit/compile engines, DAG operations, and the storage
//! contract. It integrates with `thiserror` to provide rich `Display`
//! implementations and error source chaining where applicable.
//!
//! Notes:
//! - Each variant carries structured fields (target hashes, budget numbers,
//!   candidate lists) so callers can format precise messages without parsing
//!   strings.
//! - LLM client failures have their own hierarchy ([`LLMError`]) and are
//!   folded into [`TractError`] via `From`.

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, TractError>;

/// Typed LLM client failure hierarchy.
///
/// Retries and backoff live in the client implementation; the engine only
/// propagates these.
#[derive(Error, Debug)]
pub enum LLMError {
    /// Credentials missing, expired, or rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Provider throttled the request.
    #[error("rate limited{}: {message}", .retry_after_secs.map(|s| format!(" (retry after {s}s)")).unwrap_or_default())]
    RateLimit {
        message: String,
        /// Provider-suggested wait, when the response carried one.
        retry_after_secs: Option<u64>,
    },

    /// The response body did not match the expected shape.
    #[error("malformed response: {0}")]
    ResponseFormat(String),

    /// Connection, TLS, or timeout failure.
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Error, Debug)]
/// Unified error enumeration for the Tract library.
///
/// - Used across content validation, hashing, the write/read pipelines,
///   navigation, merge/rebase/cherry-pick, and compression.
/// - Implements `std::error::Error` via `thiserror`.
pub enum TractError {
    /// A JSON body did not match its claimed content discriminator.
    #[error("invalid `{content_type}` content: {reason}")]
    ContentValidation { content_type: String, reason: String },

    /// EDIT preconditions violated (missing, unknown, or already-an-edit target).
    #[error("invalid edit target{}: {reason}", .target.as_ref().map(|t| format!(" `{t}`")).unwrap_or_default())]
    EditTarget {
        target: Option<String>,
        reason: String,
    },

    /// Commit attempted while HEAD is detached.
    #[error("HEAD is detached at {at}; attach to a branch before committing")]
    DetachedHead { at: String },

    /// A ref, hash, or prefix resolved to nothing.
    #[error("commit not found: `{0}`")]
    CommitNotFound(String),

    /// A hash prefix matched more than one commit.
    #[error("prefix `{prefix}` is ambiguous ({} candidates: {})", .candidates.len(), .candidates.join(", "))]
    AmbiguousPrefix {
        prefix: String,
        /// Up to five matching hashes.
        candidates: Vec<String>,
    },

    /// Token budget breached under the REJECT policy.
    #[error("token budget exceeded: {total} of {budget} after {attempted} attempted tokens")]
    BudgetExceeded {
        total: u64,
        budget: u64,
        attempted: u64,
    },

    /// Merge stopped on structural conflicts.
    #[error("merge produced {0} unresolved conflict(s)")]
    MergeConflict(usize),

    /// Semantic merge aborted by the resolver.
    #[error("merge aborted: {0}")]
    MergeAborted(String),

    /// Rebase would orphan an edit or silently change compiled meaning.
    #[error("rebase safety violation at {commit}: {reason}")]
    SemanticSafety { commit: String, reason: String },

    /// Cherry-pick would orphan the commit being replayed.
    #[error("cannot cherry-pick {commit}: {reason}")]
    CherryPick { commit: String, reason: String },

    /// Compression plan invalidated (HEAD moved) or produced unusable output.
    #[error("compression failed: {0}")]
    Compression(String),

    /// The retry controller exhausted its attempts.
    #[error("retry exhausted after {attempts} attempt(s){}", .last_diagnosis.as_ref().map(|d| format!("; last diagnosis: {d}")).unwrap_or_default())]
    RetryExhausted {
        attempts: u32,
        last_diagnosis: Option<String>,
        /// The last rejected attempt's output, serialized, so callers can
        /// inspect or salvage it (e.g. a failed summary's text).
        last_result: Option<serde_json::Value>,
    },

    /// Invalid function argument (mutually exclusive cutoffs, empty range).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Propagated LLM client failure.
    #[error(transparent)]
    Llm(#[from] LLMError),

    /// Backend constraint breach (foreign key, duplicate, missing row).
    #[error("storage error: {0}")]
    Storage(String),

    /// Payload (de)serialization failure outside content validation.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TractError {
    /// Shorthand for a storage-contract violation.
    pub fn storage(msg: impl Into<String>) -> Self {
        TractError::Storage(msg.into())
    }
}
