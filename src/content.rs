//! Typed conversational content and the per-instance type registry.
//!
//! Content is a closed sum type with a string discriminator (`"type"`),
//! serialized as internally tagged JSON. Each variant carries behavioural
//! hints: a default priority, a default API role, a compression priority
//! (lower compresses first), and an aggregation rule. A per-tract
//! [`ContentRegistry`] may introduce additional variants that shadow
//! built-ins by discriminator name; the registry is consulted before
//! built-in dispatch, and the read pipeline's structural text probe keeps
//! custom types compilable without touching the compiler.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{Result, TractError};
use crate::hash::canonical_json;
use crate::model::Priority;

/// Speaker role of a dialogue turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogueRole {
    User,
    Assistant,
    System,
}

impl DialogueRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            DialogueRole::User => "user",
            DialogueRole::Assistant => "assistant",
            DialogueRole::System => "system",
        }
    }
}

impl fmt::Display for DialogueRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a tool exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolDirection {
    Call,
    Result,
}

/// Declared format of an `output` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Text,
    Markdown,
    Json,
}

/// Whether consecutive same-role messages of this type collapse into one
/// message during compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationRule {
    #[default]
    Collapse,
    /// Never merged with neighbours, even on a same-role run.
    Isolate,
}

/// Behavioural hints attached to a content type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentHints {
    pub default_priority: Priority,
    pub default_role: String,
    /// 0–100; lower compresses first.
    pub compression_priority: u8,
    pub aggregation: AggregationRule,
}

impl ContentHints {
    fn new(priority: Priority, role: &str, compression: u8) -> Self {
        ContentHints {
            default_priority: priority,
            default_role: role.to_string(),
            compression_priority: compression,
            aggregation: AggregationRule::Collapse,
        }
    }
}

impl Default for ContentHints {
    /// Fallback hints for unknown discriminators.
    fn default() -> Self {
        ContentHints::new(Priority::Normal, "assistant", 50)
    }
}

/// Built-in content variants, internally tagged by `"type"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    /// System-level directive; pinned by default.
    Instruction { text: String },
    /// One conversational turn.
    Dialogue {
        role: DialogueRole,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// A tool call or its result.
    ToolIo {
        tool_name: String,
        direction: ToolDirection,
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
    /// Model chain-of-thought retained for context.
    Reasoning { text: String },
    /// Generated artifact (code, document, data).
    Artifact {
        artifact_type: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },
    /// Final model output in a declared format.
    Output {
        text: String,
        #[serde(default)]
        format: OutputFormat,
    },
    /// Arbitrary JSON payload.
    Freeform { payload: Value },
    /// Output of history compression; replaces a summarized range.
    Summary { text: String },
}

impl Content {
    /// Convenience constructors for the common variants.
    pub fn instruction(text: impl Into<String>) -> Self {
        Content::Instruction { text: text.into() }
    }

    pub fn dialogue(role: DialogueRole, text: impl Into<String>) -> Self {
        Content::Dialogue {
            role,
            text: text.into(),
            name: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Content::dialogue(DialogueRole::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Content::dialogue(DialogueRole::Assistant, text)
    }

    pub fn summary(text: impl Into<String>) -> Self {
        Content::Summary { text: text.into() }
    }

    /// The discriminator string stored as the commit's `content_type`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Content::Instruction { .. } => "instruction",
            Content::Dialogue { .. } => "dialogue",
            Content::ToolIo { .. } => "tool_io",
            Content::Reasoning { .. } => "reasoning",
            Content::Artifact { .. } => "artifact",
            Content::Output { .. } => "output",
            Content::Freeform { .. } => "freeform",
            Content::Summary { .. } => "summary",
        }
    }

    /// Behavioural hints for this variant.
    pub fn hints(&self) -> ContentHints {
        builtin_hints(self.type_name()).unwrap_or_default()
    }

    /// Display text of this content, as it appears in compiled messages.
    pub fn text(&self) -> String {
        match self {
            Content::Instruction { text }
            | Content::Reasoning { text }
            | Content::Output { text, .. }
            | Content::Summary { text }
            | Content::Dialogue { text, .. } => text.clone(),
            Content::Artifact { content, .. } => content.clone(),
            Content::ToolIo { payload, .. } | Content::Freeform { payload } => {
                canonical_json(payload)
            }
        }
    }

    /// Serialize to the tagged JSON body stored in the blob.
    pub fn to_value(&self) -> Value {
        // A plain tagged enum serializes infallibly.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Parse a tagged JSON body back into a built-in variant.
    pub fn from_value(value: &Value) -> Result<Self> {
        let claimed = discriminator(value).unwrap_or("<missing>").to_string();
        serde_json::from_value(value.clone()).map_err(|e| TractError::ContentValidation {
            content_type: claimed,
            reason: e.to_string(),
        })
    }
}

/// Built-in hints table, keyed by discriminator.
pub fn builtin_hints(type_name: &str) -> Option<ContentHints> {
    let hints = match type_name {
        "instruction" => ContentHints::new(Priority::Pinned, "system", 90),
        "dialogue" => ContentHints::new(Priority::Normal, "user", 50),
        "tool_io" => ContentHints::new(Priority::Normal, "tool", 20),
        "reasoning" => ContentHints::new(Priority::Normal, "assistant", 10),
        "artifact" => ContentHints::new(Priority::Normal, "assistant", 60),
        "output" => ContentHints::new(Priority::Normal, "assistant", 40),
        "freeform" => ContentHints::new(Priority::Normal, "assistant", 30),
        "summary" => ContentHints::new(Priority::Normal, "system", 10),
        _ => return None,
    };
    Some(hints)
}

/// Read the `"type"` discriminator of a JSON body.
pub fn discriminator(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

/// Structural text probe for arbitrary content bodies: `text` field, then a
/// string `content` field, then the canonical JSON of `payload`, else empty.
/// Keeps registry-typed content compilable without variant knowledge.
pub fn extract_text(value: &Value) -> String {
    if let Some(text) = value.get("text").and_then(Value::as_str) {
        return text.to_string();
    }
    if let Some(content) = value.get("content").and_then(Value::as_str) {
        return content.to_string();
    }
    if let Some(payload) = value.get("payload") {
        return canonical_json(payload);
    }
    String::new()
}

/// Validation callback for a registered content type. Returns a reason
/// string on rejection.
pub type ContentValidator = Box<dyn Fn(&Value) -> std::result::Result<(), String> + Send + Sync>;

/// A registry-supplied content type; shadows a built-in of the same name.
pub struct CustomContentType {
    pub name: String,
    pub hints: ContentHints,
    validator: Option<ContentValidator>,
}

impl CustomContentType {
    pub fn new(name: impl Into<String>, hints: ContentHints) -> Self {
        CustomContentType {
            name: name.into(),
            hints,
            validator: None,
        }
    }

    pub fn with_validator(mut self, validator: ContentValidator) -> Self {
        self.validator = Some(validator);
        self
    }
}

impl fmt::Debug for CustomContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomContentType")
            .field("name", &self.name)
            .field("hints", &self.hints)
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

/// Per-tract content type registry. Custom entries take precedence over
/// built-ins with the same discriminator.
#[derive(Debug, Default)]
pub struct ContentRegistry {
    custom: HashMap<String, CustomContentType>,
}

impl ContentRegistry {
    pub fn new() -> Self {
        ContentRegistry::default()
    }

    pub fn register(&mut self, content_type: CustomContentType) {
        self.custom
            .insert(content_type.name.clone(), content_type);
    }

    pub fn get(&self, name: &str) -> Option<&CustomContentType> {
        self.custom.get(name)
    }

    /// Effective hints for a discriminator: registry first, then built-in,
    /// then the fallback.
    pub fn hints_for(&self, name: &str) -> ContentHints {
        if let Some(custom) = self.custom.get(name) {
            return custom.hints.clone();
        }
        builtin_hints(name).unwrap_or_default()
    }

    /// Validate a JSON body against its claimed discriminator and return
    /// the discriminator on success.
    pub fn validate(&self, value: &Value) -> Result<String> {
        let name = discriminator(value)
            .ok_or_else(|| TractError::ContentValidation {
                content_type: "<missing>".to_string(),
                reason: "content body has no `type` discriminator".to_string(),
            })?
            .to_string();

        if let Some(custom) = self.custom.get(&name) {
            if let Some(validator) = &custom.validator {
                validator(value).map_err(|reason| TractError::ContentValidation {
                    content_type: name.clone(),
                    reason,
                })?;
            }
            return Ok(name);
        }

        Content::from_value(value)?;
        Ok(name)
    }
}
