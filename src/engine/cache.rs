//! LRU snapshot cache for compiled contexts, with incremental extension for
//! the two common mutations: appending at the tip and editing a recent
//! commit.
//!
//! The cache is advisory. Storage is always the source of truth: a miss is
//! resolved by a full compile, a crash simply discards the cache, and any
//! mutation the extension routines cannot reproduce exactly (priority
//! changes, merges, edits behind an aggregated run) falls back to a full
//! compile by returning `None`.

use schnellru::{ByLength, LruMap};

use crate::content::AggregationRule;
use crate::engine::compile::{AGGREGATION_JOINER, CompiledContext, CompiledMessage};
use crate::engine::tokens::TokenCounter;
use crate::errors::Result;
use crate::model::GenerationConfig;
use crate::storage::Storage;

/// Internal representation of a compiled context, keyed by HEAD hash.
/// Tool schemas are kept as hashes and re-resolved on the way out.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileSnapshot {
    pub messages: Vec<CompiledMessage>,
    pub token_count: u64,
    pub commit_count: usize,
    pub token_source: String,
    pub generation_configs: Vec<Option<GenerationConfig>>,
    pub commit_hashes: Vec<String>,
    pub tool_hashes: Vec<String>,
    /// Aggregation rule of the trailing message's content type; gates
    /// merge-on-append.
    pub last_aggregation: AggregationRule,
}

impl CompileSnapshot {
    pub fn from_context(context: &CompiledContext, last_aggregation: AggregationRule) -> Self {
        CompileSnapshot {
            messages: context.messages.clone(),
            token_count: context.token_count,
            commit_count: context.commit_count,
            token_source: context.token_source.clone(),
            generation_configs: context.generation_configs.clone(),
            commit_hashes: context.commit_hashes.clone(),
            tool_hashes: context.tools.iter().map(|t| t.content_hash.clone()).collect(),
            last_aggregation,
        }
    }

    /// Rehydrate into the public shape, resolving tool hashes to schemas.
    pub fn into_context(self, storage: &dyn Storage) -> Result<CompiledContext> {
        let mut tools = Vec::with_capacity(self.tool_hashes.len());
        for hash in &self.tool_hashes {
            if let Some(schema) = storage.tools().get(hash)? {
                tools.push(schema);
            }
        }
        Ok(CompiledContext {
            messages: self.messages,
            token_count: self.token_count,
            commit_count: self.commit_count,
            token_source: self.token_source,
            generation_configs: self.generation_configs,
            commit_hashes: self.commit_hashes,
            tools,
        })
    }
}

/// What an APPEND at the tip contributes to a cached snapshot.
#[derive(Debug, Clone)]
pub struct AppendExtension {
    /// The new commit's hash: the key the extended snapshot is stored under.
    pub commit_hash: String,
    pub message: CompiledMessage,
    pub aggregation: AggregationRule,
    pub generation_config: Option<GenerationConfig>,
    /// Tool hashes linked to the new commit; replaces the active set when
    /// non-empty.
    pub tool_hashes: Vec<String>,
}

/// What an EDIT of an earlier commit contributes to a cached snapshot.
#[derive(Debug, Clone)]
pub struct EditExtension {
    /// The edit commit's hash (the new HEAD).
    pub commit_hash: String,
    /// The `append` commit whose position is being re-derived.
    pub target_hash: String,
    pub message: CompiledMessage,
    pub generation_config: Option<GenerationConfig>,
}

/// LRU mapping from HEAD hash to compile snapshot.
pub struct CacheManager {
    entries: LruMap<String, CompileSnapshot, ByLength>,
}

impl CacheManager {
    pub fn new(capacity: u32) -> Self {
        CacheManager {
            entries: LruMap::new(ByLength::new(capacity.max(1))),
        }
    }

    pub fn get(&mut self, head: &str) -> Option<CompileSnapshot> {
        self.entries.get(head).cloned()
    }

    pub fn put(&mut self, head: impl Into<String>, snapshot: CompileSnapshot) {
        self.entries.insert(head.into(), snapshot);
    }

    pub fn invalidate(&mut self, head: &str) {
        self.entries.remove(head);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Extend a cached snapshot for an APPEND at `parent_head`.
    ///
    /// Merges into the trailing message when roles match and both sides
    /// aggregate, exactly as a full compile would; token accounting is
    /// recomputed for the affected message only. Returns the snapshot now
    /// cached under the new commit's hash, or `None` on a cache miss.
    pub fn extend_for_append(
        &mut self,
        parent_head: &str,
        extension: &AppendExtension,
        counter: &dyn TokenCounter,
    ) -> Option<CompileSnapshot> {
        let mut snapshot = self.get(parent_head)?;

        let merge = extension.aggregation == AggregationRule::Collapse
            && snapshot.last_aggregation == AggregationRule::Collapse
            && snapshot
                .messages
                .last()
                .is_some_and(|last| last.role == extension.message.role);
        if merge && let Some(last) = snapshot.messages.last_mut() {
            // Token delta: replace the old trailing contribution with the
            // merged one; BPE counts are not additive across joins.
            let before = counter.count_message(&last.to_chat_message());
            last.content.push_str(AGGREGATION_JOINER);
            last.content.push_str(&extension.message.content);
            let after = counter.count_message(&last.to_chat_message());
            snapshot.token_count = snapshot.token_count - before + after;
        } else {
            let contribution = counter.count_message(&extension.message.to_chat_message());
            snapshot.token_count = if snapshot.messages.is_empty() {
                counter.count_messages(&[extension.message.to_chat_message()])
            } else {
                snapshot.token_count + contribution
            };
            snapshot.messages.push(extension.message.clone());
            snapshot
                .generation_configs
                .push(extension.generation_config.clone());
        }
        snapshot.commit_count += 1;
        snapshot.commit_hashes.push(extension.commit_hash.clone());
        snapshot.last_aggregation = extension.aggregation;
        if !extension.tool_hashes.is_empty() {
            snapshot.tool_hashes = extension.tool_hashes.clone();
        }

        self.put(extension.commit_hash.clone(), snapshot.clone());
        Some(snapshot)
    }

    /// Extend a cached snapshot for an EDIT of `target_hash`.
    ///
    /// Only possible while commits and messages are still 1:1 (no
    /// aggregated runs): otherwise the edited position cannot be patched in
    /// place and the caller must recompile.
    pub fn extend_for_edit(
        &mut self,
        parent_head: &str,
        extension: &EditExtension,
        counter: &dyn TokenCounter,
    ) -> Option<CompileSnapshot> {
        let mut snapshot = self.get(parent_head)?;
        if snapshot.messages.len() != snapshot.commit_hashes.len() {
            return None;
        }
        let index = snapshot
            .commit_hashes
            .iter()
            .position(|hash| hash == &extension.target_hash)?;

        let before = counter.count_message(&snapshot.messages[index].to_chat_message());
        let after = counter.count_message(&extension.message.to_chat_message());
        snapshot.messages[index] = extension.message.clone();
        snapshot.generation_configs[index] = extension.generation_config.clone();
        snapshot.token_count = snapshot.token_count - before + after;

        self.put(extension.commit_hash.clone(), snapshot.clone());
        Some(snapshot)
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("len", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tokens::TokenCounter;
    use crate::llm::ChatMessage;

    struct OnePerChar;

    impl TokenCounter for OnePerChar {
        fn count_text(&self, text: &str) -> u64 {
            text.chars().count() as u64
        }

        fn source(&self) -> &'static str {
            "test"
        }
    }

    fn message(role: &str, content: &str) -> CompiledMessage {
        CompiledMessage {
            role: role.to_string(),
            content: content.to_string(),
            name: None,
        }
    }

    fn snapshot(messages: Vec<CompiledMessage>, counter: &dyn TokenCounter) -> CompileSnapshot {
        let chat: Vec<ChatMessage> = messages.iter().map(|m| m.to_chat_message()).collect();
        let token_count = if chat.is_empty() { 0 } else { counter.count_messages(&chat) };
        CompileSnapshot {
            commit_hashes: (0..messages.len()).map(|i| format!("c{i}")).collect(),
            generation_configs: vec![None; messages.len()],
            commit_count: messages.len(),
            token_count,
            token_source: "test".to_string(),
            tool_hashes: Vec::new(),
            last_aggregation: AggregationRule::Collapse,
            messages,
        }
    }

    #[test]
    fn test_lru_eviction() {
        let counter = OnePerChar;
        let mut cache = CacheManager::new(2);
        cache.put("h1", snapshot(vec![message("user", "a")], &counter));
        cache.put("h2", snapshot(vec![message("user", "b")], &counter));
        cache.put("h3", snapshot(vec![message("user", "c")], &counter));
        assert!(cache.get("h1").is_none());
        assert!(cache.get("h2").is_some());
        assert!(cache.get("h3").is_some());
    }

    /// Extending for an append must equal the snapshot a cold compile would
    /// build, including token accounting across a same-role merge.
    #[test]
    fn test_extend_for_append_merges_same_role() {
        let counter = OnePerChar;
        let mut cache = CacheManager::new(8);
        cache.put("h1", snapshot(vec![message("user", "ab")], &counter));

        let extended = cache
            .extend_for_append(
                "h1",
                &AppendExtension {
                    commit_hash: "h2".to_string(),
                    message: message("user", "cd"),
                    aggregation: AggregationRule::Collapse,
                    generation_config: None,
                    tool_hashes: Vec::new(),
                },
                &counter,
            )
            .unwrap();
        assert_eq!(extended.messages.len(), 1);
        assert_eq!(extended.messages[0].content, "ab\n\ncd");
        assert_eq!(extended.commit_count, 2);
        // equals a cold count: one message "ab\n\ncd" (8 chars) + 3 + 3
        let expected = snapshot(vec![message("user", "ab\n\ncd")], &counter).token_count;
        assert_eq!(extended.token_count, expected);
        assert!(cache.get("h2").is_some());
    }

    #[test]
    fn test_extend_for_append_distinct_role() {
        let counter = OnePerChar;
        let mut cache = CacheManager::new(8);
        cache.put("h1", snapshot(vec![message("user", "ab")], &counter));
        let extended = cache
            .extend_for_append(
                "h1",
                &AppendExtension {
                    commit_hash: "h2".to_string(),
                    message: message("assistant", "cd"),
                    aggregation: AggregationRule::Collapse,
                    generation_config: None,
                    tool_hashes: Vec::new(),
                },
                &counter,
            )
            .unwrap();
        assert_eq!(extended.messages.len(), 2);
        let expected = snapshot(
            vec![message("user", "ab"), message("assistant", "cd")],
            &counter,
        )
        .token_count;
        assert_eq!(extended.token_count, expected);
    }

    #[test]
    fn test_extend_for_edit_patches_position() {
        let counter = OnePerChar;
        let mut cache = CacheManager::new(8);
        cache.put(
            "h2",
            snapshot(vec![message("user", "ab"), message("assistant", "cd")], &counter),
        );
        let extended = cache
            .extend_for_edit(
                "h2",
                &EditExtension {
                    commit_hash: "h3".to_string(),
                    target_hash: "c0".to_string(),
                    message: message("user", "abcdef"),
                    generation_config: None,
                },
                &counter,
            )
            .unwrap();
        assert_eq!(extended.messages[0].content, "abcdef");
        let expected = snapshot(
            vec![message("user", "abcdef"), message("assistant", "cd")],
            &counter,
        )
        .token_count;
        assert_eq!(extended.token_count, expected);
    }

    /// Aggregated runs break the 1:1 commit/message mapping; the edit
    /// extension must decline rather than guess.
    #[test]
    fn test_extend_for_edit_declines_after_aggregation() {
        let counter = OnePerChar;
        let mut cache = CacheManager::new(8);
        let mut aggregated = snapshot(vec![message("user", "ab\n\ncd")], &counter);
        aggregated.commit_hashes = vec!["c0".to_string(), "c1".to_string()];
        aggregated.commit_count = 2;
        cache.put("h2", aggregated);
        let result = cache.extend_for_edit(
            "h2",
            &EditExtension {
                commit_hash: "h3".to_string(),
                target_hash: "c0".to_string(),
                message: message("user", "x"),
                generation_config: None,
            },
            &counter,
        );
        assert!(result.is_none());
    }

    #[test]
    fn test_invalidate_and_clear() {
        let counter = OnePerChar;
        let mut cache = CacheManager::new(8);
        cache.put("h1", snapshot(vec![message("user", "a")], &counter));
        cache.invalidate("h1");
        assert!(cache.get("h1").is_none());
        cache.put("h1", snapshot(vec![message("user", "a")], &counter));
        cache.clear();
        assert!(cache.get("h1").is_none());
    }
}
