//! The read pipeline: from a HEAD hash to a flat, role-tagged message
//! sequence.
//!
//! Compilation walks the commit DAG (deterministic topological order for
//! merge histories), resolves edits to their latest revision, applies the
//! latest priority annotation per commit, maps typed content to API roles,
//! collapses consecutive same-role messages, and computes the token count of
//! the compiled request. The result is a pure function of the reachable
//! subgraph, its blobs, and the latest annotations.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::content::{AggregationRule, ContentRegistry, extract_text};
use crate::engine::tokens::TokenCounter;
use crate::errors::{Result, TractError};
use crate::llm::ChatMessage;
use crate::model::{CommitRecord, GenerationConfig, Operation, Priority, ToolSchemaRecord};
use crate::storage::{Storage, topological_order};

/// Separator used when same-role messages collapse into one.
pub const AGGREGATION_JOINER: &str = "\n\n";

/// Marker appended to edited content when edit annotations are requested.
const EDITED_MARKER: &str = " [edited]";

/// Cutoffs and flags for a compile call. At most one of `as_of` and `up_to`
/// may be set.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Ignore commits and annotations created after this instant.
    pub as_of: Option<DateTime<Utc>>,
    /// Truncate the walked order after this commit hash.
    pub up_to: Option<String>,
    /// Append a marker to messages whose content was edited.
    pub include_edit_annotations: bool,
}

impl CompileOptions {
    pub fn is_default(&self) -> bool {
        self.as_of.is_none() && self.up_to.is_none() && !self.include_edit_annotations
    }
}

/// One compiled, role-tagged message.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CompiledMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl CompiledMessage {
    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage {
            role: self.role.clone(),
            content: self.content.clone(),
            name: self.name.clone(),
        }
    }

    fn to_dict(&self) -> Value {
        let mut obj = json!({"role": self.role, "content": self.content});
        if let Some(name) = &self.name {
            obj["name"] = Value::from(name.as_str());
        }
        obj
    }
}

/// The output of compilation: message list, token accounting, per-message
/// generation configs, the effective commit hashes, and the active tool
/// schemas (provenance, never messages).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompiledContext {
    pub messages: Vec<CompiledMessage>,
    pub token_count: u64,
    pub commit_count: usize,
    /// Name of the counter that produced `token_count`.
    pub token_source: String,
    /// Aligned with `messages`; an aggregated run reports the config of its
    /// first commit.
    pub generation_configs: Vec<Option<GenerationConfig>>,
    /// Effective commits, root-first.
    pub commit_hashes: Vec<String>,
    pub tools: Vec<ToolSchemaRecord>,
}

impl CompiledContext {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The messages as chat-request input.
    pub fn chat_messages(&self) -> Vec<ChatMessage> {
        self.messages.iter().map(CompiledMessage::to_chat_message).collect()
    }

    /// Plain `{role, content, name?}` dicts.
    pub fn to_dicts(&self) -> Vec<Value> {
        self.messages.iter().map(CompiledMessage::to_dict).collect()
    }

    /// OpenAI chat shape: identical to `to_dicts`, system messages inline.
    pub fn to_openai(&self) -> Vec<Value> {
        self.to_dicts()
    }

    /// Anthropic shape: system messages extracted and concatenated; the
    /// remaining turns carry only user/assistant roles (tool output rides
    /// in user turns).
    pub fn to_anthropic(&self) -> Value {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut messages: Vec<Value> = Vec::new();
        for message in &self.messages {
            if message.role == "system" {
                system_parts.push(&message.content);
                continue;
            }
            let role = if message.role == "assistant" {
                "assistant"
            } else {
                "user"
            };
            let mut obj = json!({"role": role, "content": message.content});
            if let Some(name) = &message.name {
                obj["name"] = Value::from(name.as_str());
            }
            messages.push(obj);
        }
        let system = (!system_parts.is_empty()).then(|| system_parts.join(AGGREGATION_JOINER));
        json!({"system": system, "messages": messages})
    }

    /// `to_openai` plus the active tool schemas, ready to splat into a
    /// request body.
    pub fn to_openai_params(&self) -> Value {
        let mut params = json!({"messages": self.to_openai()});
        if !self.tools.is_empty() {
            params["tools"] = Value::from(
                self.tools.iter().map(|t| t.schema.clone()).collect::<Vec<_>>(),
            );
        }
        params
    }

    /// `to_anthropic` plus the active tool schemas.
    pub fn to_anthropic_params(&self) -> Value {
        let mut params = self.to_anthropic();
        if !self.tools.is_empty() {
            params["tools"] = Value::from(
                self.tools.iter().map(|t| t.schema.clone()).collect::<Vec<_>>(),
            );
        }
        params
    }
}

/// Map a content body to its API role.
///
/// Priority order, first match wins: the per-compiler override map, the
/// dialogue body's own `role` field, the `tool` role for tool exchanges,
/// the content type's default-role hint (which also covers the `assistant`
/// fallback for unknown types).
pub(crate) fn role_for(
    registry: &ContentRegistry,
    role_overrides: Option<&HashMap<String, String>>,
    content_type: &str,
    body: &Value,
) -> String {
    if let Some(role) = role_overrides.and_then(|m| m.get(content_type)) {
        return role.clone();
    }
    if content_type == "dialogue" {
        if let Some(role) = body.get("role").and_then(Value::as_str) {
            return role.to_string();
        }
    }
    if content_type == "tool_io" {
        return "tool".to_string();
    }
    registry.hints_for(content_type).default_role
}

/// A message before aggregation, carrying its source commit's metadata.
struct BuiltMessage {
    role: String,
    content: String,
    name: Option<String>,
    generation_config: Option<GenerationConfig>,
    aggregation: AggregationRule,
}

/// The read-path engine. Stateless; one instance per facade.
pub struct Compiler<'a> {
    storage: &'a dyn Storage,
    counter: &'a dyn TokenCounter,
    registry: &'a ContentRegistry,
    role_overrides: Option<&'a HashMap<String, String>>,
}

impl<'a> Compiler<'a> {
    pub fn new(
        storage: &'a dyn Storage,
        counter: &'a dyn TokenCounter,
        registry: &'a ContentRegistry,
        role_overrides: Option<&'a HashMap<String, String>>,
    ) -> Self {
        Compiler {
            storage,
            counter,
            registry,
            role_overrides,
        }
    }

    /// Compile the history reachable from `head` into a [`CompiledContext`].
    ///
    /// An empty head compiles to an empty context. `up_to` truncates the
    /// walked order after the named hash; `as_of` filters out commits and
    /// annotations newer than the cutoff; setting both is an error.
    pub fn compile(
        &self,
        tract_id: &str,
        head: Option<&str>,
        options: &CompileOptions,
    ) -> Result<CompiledContext> {
        if options.as_of.is_some() && options.up_to.is_some() {
            return Err(TractError::InvalidArgument(
                "`as_of` and `up_to` are mutually exclusive".to_string(),
            ));
        }
        let Some(head) = head else {
            return Ok(CompiledContext {
                token_source: self.counter.source().to_string(),
                ..CompiledContext::default()
            });
        };

        let mut walked = self.walk(head)?;
        if let Some(up_to) = &options.up_to {
            let position = walked
                .iter()
                .position(|row| &row.commit_hash == up_to)
                .ok_or_else(|| TractError::CommitNotFound(up_to.clone()))?;
            walked.truncate(position + 1);
        }
        if let Some(as_of) = options.as_of {
            walked.retain(|row| row.created_at <= as_of);
        }

        let edit_map = build_edit_map(&walked);
        let append_hashes: Vec<String> = walked
            .iter()
            .filter(|row| row.operation == Operation::Append)
            .map(|row| row.commit_hash.clone())
            .collect();
        let annotations = self
            .storage
            .annotations()
            .batch_get_latest(&append_hashes, options.as_of)?;

        let mut built: Vec<BuiltMessage> = Vec::new();
        let mut commit_hashes: Vec<String> = Vec::new();
        let mut tool_hashes: Vec<String> = Vec::new();
        for row in walked.iter().filter(|row| row.operation == Operation::Append) {
            let priority = annotations
                .get(&row.commit_hash)
                .map(|a| a.priority)
                .unwrap_or_else(|| {
                    self.registry.hints_for(&row.content_type).default_priority
                });
            if priority == Priority::Skip {
                continue;
            }

            let source: &CommitRecord = edit_map.get(&row.commit_hash).copied().unwrap_or(row);
            let blob = self
                .storage
                .blobs()
                .get(&source.content_hash)?
                .ok_or_else(|| {
                    TractError::storage(format!(
                        "commit {} references missing blob {}",
                        source.commit_hash, source.content_hash
                    ))
                })?;
            let mut content = extract_text(&blob.payload);
            if options.include_edit_annotations && edit_map.contains_key(&row.commit_hash) {
                content.push_str(EDITED_MARKER);
            }
            built.push(BuiltMessage {
                role: role_for(
                    self.registry,
                    self.role_overrides,
                    &source.content_type,
                    &blob.payload,
                ),
                content,
                name: blob
                    .payload
                    .get("name")
                    .and_then(Value::as_str)
                    .map(String::from),
                generation_config: source.generation_config.clone(),
                aggregation: self.registry.hints_for(&source.content_type).aggregation,
            });
            commit_hashes.push(row.commit_hash.clone());

            let linked = self.storage.tools().get_commit_tool_hashes(&row.commit_hash)?;
            if !linked.is_empty() {
                tool_hashes = linked;
            }
        }

        let (messages, generation_configs) = aggregate(built);
        let token_count = if messages.is_empty() {
            0
        } else {
            self.counter.count_messages(
                &messages.iter().map(CompiledMessage::to_chat_message).collect::<Vec<_>>(),
            )
        };

        let mut tools = Vec::with_capacity(tool_hashes.len());
        for hash in &tool_hashes {
            if let Some(schema) = self.storage.tools().get(hash)? {
                tools.push(schema);
            } else {
                tracing::warn!(tool = %hash, tract = %tract_id, "tool link resolves to no schema");
            }
        }

        Ok(CompiledContext {
            commit_count: commit_hashes.len(),
            token_count,
            token_source: self.counter.source().to_string(),
            messages,
            generation_configs,
            commit_hashes,
            tools,
        })
    }

    /// Walk the ancestor subgraph of `head` into deterministic root-first
    /// order.
    fn walk(&self, head: &str) -> Result<Vec<CommitRecord>> {
        let order = topological_order(self.storage, head)?;
        if order.is_empty() {
            return Err(TractError::CommitNotFound(head.to_string()));
        }
        Ok(order)
    }
}

/// For every EDIT commit in the walked set, record `edit_target -> latest
/// EDIT` (latest by `created_at`, tie-break by `commit_hash`). Edits of
/// targets outside the walk stay in the map and simply never apply.
fn build_edit_map(walked: &[CommitRecord]) -> HashMap<String, &CommitRecord> {
    let mut map: HashMap<String, &CommitRecord> = HashMap::new();
    for row in walked {
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

/// Collapse consecutive messages with identical roles into one message,
/// joining content and taking the name and generation config from the first
/// of the run. Types with the `Isolate` rule never merge.
fn aggregate(built: Vec<BuiltMessage>) -> (Vec<CompiledMessage>, Vec<Option<GenerationConfig>>) {
    let mut messages: Vec<CompiledMessage> = Vec::new();
    let mut configs: Vec<Option<GenerationConfig>> = Vec::new();
    let mut last_rule = AggregationRule::Collapse;
    for message in built {
        let mergeable = message.aggregation == AggregationRule::Collapse
            && last_rule == AggregationRule::Collapse
            && messages
                .last()
                .is_some_and(|prev| prev.role == message.role);
        if mergeable {
            if let Some(prev) = messages.last_mut() {
                prev.content.push_str(AGGREGATION_JOINER);
                prev.content.push_str(&message.content);
            }
        } else {
            messages.push(CompiledMessage {
                role: message.role,
                content: message.content,
                name: message.name,
            });
            configs.push(message.generation_config);
        }
        last_rule = message.aggregation;
    }
    (messages, configs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Priority;

    fn built(role: &str, content: &str) -> BuiltMessage {
        BuiltMessage {
            role: role.to_string(),
            content: content.to_string(),
            name: None,
            generation_config: None,
            aggregation: AggregationRule::Collapse,
        }
    }

    #[test]
    fn test_aggregate_collapses_same_role_runs() {
        let (messages, configs) = aggregate(vec![
            built("system", "a"),
            built("user", "b"),
            built("user", "c"),
            built("assistant", "d"),
        ]);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].content, "b\n\nc");
        assert_eq!(configs.len(), 3);
        // no two adjacent messages share a role
        for pair in messages.windows(2) {
            assert_ne!(pair[0].role, pair[1].role);
        }
    }

    #[test]
    fn test_aggregate_takes_first_name_of_run() {
        let mut a = built("user", "one");
        a.name = Some("ana".to_string());
        let mut b = built("user", "two");
        b.name = Some("bob".to_string());
        let (messages, _) = aggregate(vec![a, b]);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].name.as_deref(), Some("ana"));
    }

    #[test]
    fn test_aggregate_isolate_rule_blocks_merge() {
        let mut a = built("assistant", "one");
        a.aggregation = AggregationRule::Isolate;
        let b = built("assistant", "two");
        let (messages, _) = aggregate(vec![a, b]);
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn test_role_mapping_precedence() {
        let registry = ContentRegistry::new();
        let dialogue = serde_json::json!({"type": "dialogue", "role": "user", "text": "x"});
        assert_eq!(role_for(&registry, None, "dialogue", &dialogue), "user");
        assert_eq!(role_for(&registry, None, "tool_io", &serde_json::json!({})), "tool");
        assert_eq!(role_for(&registry, None, "instruction", &serde_json::json!({})), "system");
        // unknown types fall back to assistant via the default hints
        assert_eq!(role_for(&registry, None, "mystery", &serde_json::json!({})), "assistant");
        // the override map wins over everything
        let mut overrides = HashMap::new();
        overrides.insert("dialogue".to_string(), "narrator".to_string());
        assert_eq!(
            role_for(&registry, Some(&overrides), "dialogue", &dialogue),
            "narrator"
        );
    }

    #[test]
    fn test_anthropic_extraction() {
        let context = CompiledContext {
            messages: vec![
                CompiledMessage {
                    role: "system".to_string(),
                    content: "SYS1".to_string(),
                    name: None,
                },
                CompiledMessage {
                    role: "user".to_string(),
                    content: "hi".to_string(),
                    name: None,
                },
                CompiledMessage {
                    role: "system".to_string(),
                    content: "SYS2".to_string(),
                    name: None,
                },
                CompiledMessage {
                    role: "tool".to_string(),
                    content: "{}".to_string(),
                    name: None,
                },
            ],
            ..Default::default()
        };
        let out = context.to_anthropic();
        assert_eq!(out["system"], "SYS1\n\nSYS2");
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1]["role"], "user");
    }

    #[test]
    fn test_priority_default_used() {
        // smoke-check the hints fallback the compiler relies on
        let registry = ContentRegistry::new();
        assert_eq!(registry.hints_for("instruction").default_priority, Priority::Pinned);
        assert_eq!(registry.hints_for("dialogue").default_priority, Priority::Normal);
    }
}
