//! Token accounting with lazy BPE loading.
//!
//! The production counter uses a tiktoken-style BPE selected from the model
//! name; loading the encoding is deferred until the first count. When no
//! encoding is available for the model, counting degrades to a 4-chars-per-
//! token estimate. [`NullTokenCounter`] returns zero and is used in tests.

use std::sync::OnceLock;

use tiktoken_rs::{CoreBPE, get_bpe_from_model};

use crate::llm::ChatMessage;

/// Per-message framing overhead applied by chat-completion APIs.
const MESSAGE_OVERHEAD: u64 = 3;
/// Extra token charged when a message carries a `name`.
const NAME_OVERHEAD: u64 = 1;
/// Tokens reserved for priming the assistant reply.
const REPLY_PRIMER_OVERHEAD: u64 = 3;

/// Counting capability used by the write and read pipelines.
///
/// `count_messages` is defined per message so snapshot extension can
/// recompute exactly the affected positions:
/// `Σ (3 + count_text(content) + [1 if name]) + 3`.
pub trait TokenCounter: Send + Sync {
    fn count_text(&self, text: &str) -> u64;

    /// Token contribution of one message, including framing overhead.
    fn count_message(&self, message: &ChatMessage) -> u64 {
        MESSAGE_OVERHEAD
            + self.count_text(&message.content)
            + if message.name.is_some() { NAME_OVERHEAD } else { 0 }
    }

    /// Token count of a full request, including the reply primer.
    fn count_messages(&self, messages: &[ChatMessage]) -> u64 {
        messages
            .iter()
            .map(|m| self.count_message(m))
            .sum::<u64>()
            + REPLY_PRIMER_OVERHEAD
    }

    /// Short name of the counting method, recorded on compiled output.
    fn source(&self) -> &'static str;
}

/// BPE-backed counter with lazy encoding load and a character estimate
/// fallback.
pub struct BpeTokenCounter {
    model: String,
    encoder: OnceLock<Option<CoreBPE>>,
}

impl BpeTokenCounter {
    pub fn new(model: impl Into<String>) -> Self {
        BpeTokenCounter {
            model: model.into(),
            encoder: OnceLock::new(),
        }
    }

    fn encoder(&self) -> Option<&CoreBPE> {
        self.encoder
            .get_or_init(|| match get_bpe_from_model(&self.model) {
                Ok(bpe) => Some(bpe),
                Err(e) => {
                    tracing::warn!(
                        model = %self.model,
                        "no BPE encoding for model, falling back to character estimate: {e}"
                    );
                    None
                }
            })
            .as_ref()
    }
}

impl std::fmt::Debug for BpeTokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BpeTokenCounter")
            .field("model", &self.model)
            .field("loaded", &self.encoder.get().is_some())
            .finish()
    }
}

impl TokenCounter for BpeTokenCounter {
    fn count_text(&self, text: &str) -> u64 {
        match self.encoder() {
            Some(bpe) => bpe.encode_with_special_tokens(text).len() as u64,
            None => (text.len() / 4) as u64,
        }
    }

    fn source(&self) -> &'static str {
        if self.encoder().is_some() {
            "tiktoken"
        } else {
            "estimate"
        }
    }
}

/// Zero-cost counter satisfying the capability; counts nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTokenCounter;

impl TokenCounter for NullTokenCounter {
    fn count_text(&self, _text: &str) -> u64 {
        0
    }

    fn count_message(&self, _message: &ChatMessage) -> u64 {
        0
    }

    fn count_messages(&self, _messages: &[ChatMessage]) -> u64 {
        0
    }

    fn source(&self) -> &'static str {
        "null"
    }
}
