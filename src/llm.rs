//! Collaborator contracts: the chat-style LLM client and the conflict
//! resolver.
//!
//! The engine never speaks HTTP itself. Any chat-completion backend that can
//! take role-tagged messages and return text satisfies [`LLMClient`];
//! retries, backoff, and wire formats are the client's concern. The
//! [`Resolver`] turns merge conflicts, rebase warnings, and cherry-pick
//! issues into resolutions, so semantic (LLM-mediated) resolution can be
//! authored independently of which operation invoked it.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{LLMError, Result};
use crate::model::GenerationConfig;

/// One role-tagged message of a chat request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        ChatMessage {
            role: role.into(),
            content: content.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Request parameters forwarded to the client alongside the messages.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    /// Tool schemas active for this request, when the provider supports them.
    pub tools: Option<Vec<Value>>,
    /// Provider-specific passthrough parameters.
    pub extra: BTreeMap<String, Value>,
}

impl From<&GenerationConfig> for ChatOptions {
    fn from(config: &GenerationConfig) -> Self {
        ChatOptions {
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            tools: None,
            extra: config.extra.clone(),
        }
    }
}

/// Token usage reported by the provider, when available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

/// A chat completion. `model` is the resolved model string reported by the
/// provider, authoritative over the requested one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub text: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// Messages-in / text-out contract for any chat-style model.
pub trait LLMClient: Send + Sync {
    /// Send a chat request and wait for the completion. This is the only
    /// long operation the engine awaits; implementations own their timeout
    /// and retry policy.
    fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> std::result::Result<ChatResponse, LLMError>;

    /// Release any held connections. Called once when an owning tract
    /// closes; borrowed clients are never closed by the engine.
    fn close(&self) {}
}

/// What a resolver decided to do about one issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    /// Use `content_text` as the resolved content.
    Resolved,
    /// Abort the whole operation.
    Abort,
    /// Drop this issue and continue without it.
    Skip,
}

/// Resolver verdict for a single conflict or safety warning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub action: ResolutionAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

impl Resolution {
    pub fn resolved(text: impl Into<String>) -> Self {
        Resolution {
            action: ResolutionAction::Resolved,
            content_text: Some(text.into()),
            reasoning: None,
            generation_config: None,
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Resolution {
            action: ResolutionAction::Abort,
            content_text: None,
            reasoning: Some(reason.into()),
            generation_config: None,
        }
    }

    pub fn skip() -> Self {
        Resolution {
            action: ResolutionAction::Skip,
            content_text: None,
            reasoning: None,
            generation_config: None,
        }
    }
}

/// Kind of structural conflict found during a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both sides edited the same target commit.
    EditEdit,
    /// One side edited a target the other side annotated as skipped.
    EditSkip,
    /// Both sides re-annotated the same target with different priorities.
    /// Reserved for backends with per-branch annotation visibility; the
    /// built-in engine's annotation table is tract-global, so it never
    /// produces this kind.
    AnnotationDivergence,
}

/// One merge conflict, handed to the resolver under semantic merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub kind: ConflictKind,
    /// The contested commit.
    pub target_hash: String,
    /// Effective text contributed by the current branch, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ours_text: Option<String>,
    /// Effective text contributed by the merged branch, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theirs_text: Option<String>,
    pub detail: String,
}

/// A rebase safety warning presented for resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebaseWarning {
    /// The commit about to be replayed.
    pub commit_hash: String,
    pub reason: String,
}

/// A cherry-pick precondition failure presented for resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CherryPickIssue {
    pub commit_hash: String,
    pub reason: String,
}

/// The issue kinds a resolver may be asked about. The engine hands over
/// whichever applies; resolver implementations can match as narrowly or
/// broadly as they like.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolverIssue {
    Conflict(ConflictInfo),
    Rebase(RebaseWarning),
    CherryPick(CherryPickIssue),
}

/// Callable injected by the caller to settle conflicts and warnings during
/// merge, rebase, and cherry-pick.
pub trait Resolver {
    fn resolve(&mut self, issue: &ResolverIssue) -> Result<Resolution>;
}

impl<F> Resolver for F
where
    F: FnMut(&ResolverIssue) -> Result<Resolution>,
{
    fn resolve(&mut self, issue: &ResolverIssue) -> Result<Resolution> {
        self(issue)
    }
}

/// In-memory client that replays a fixed sequence of completions. A test
/// double for compression and generation flows; requests are recorded for
/// inspection.
pub struct ScriptedClient {
    responses: Mutex<VecDeque<String>>,
    model: String,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
    closed: Mutex<bool>,
}

impl ScriptedClient {
    pub fn new(responses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        ScriptedClient {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            model: "scripted-model".to_string(),
            requests: Mutex::new(Vec::new()),
            closed: Mutex::new(false),
        }
    }

    /// Message lists of every `chat` call made so far.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn was_closed(&self) -> bool {
        *self.closed.lock().expect("closed lock")
    }
}

impl LLMClient for ScriptedClient {
    fn chat(
        &self,
        messages: &[ChatMessage],
        _options: &ChatOptions,
    ) -> std::result::Result<ChatResponse, LLMError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(messages.to_vec());
        let text = self
            .responses
            .lock()
            .expect("responses lock")
            .pop_front()
            .ok_or_else(|| LLMError::ResponseFormat("script exhausted".to_string()))?;
        Ok(ChatResponse {
            text,
            model: self.model.clone(),
            usage: None,
        })
    }

    fn close(&self) {
        *self.closed.lock().expect("closed lock") = true;
    }
}
