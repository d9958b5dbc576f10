//! Tract is a content-addressed versioning engine for LLM conversation
//! context: every piece of content fed to (or produced by) a model becomes
//! an immutable, hashed commit in a DAG, and any position in that DAG
//! compiles into a flat, role-tagged message sequence ready for a chat API.
//!
//! The crate is organised in strict layers: data shapes ([`model`],
//! [`content`]), persistence contracts ([`storage`]), the hash/token/
//! commit/compile engines ([`hash`], [`engine`]), composable operations
//! over the DAG ([`ops`]), and the [`tract::Tract`] facade that owns the
//! transaction boundaries and the compile cache.

pub mod config;
pub mod content;
pub mod engine;
pub mod errors;
pub mod hash;
pub mod llm;
pub mod model;
pub mod ops;
pub mod storage;
pub mod tract;

pub use config::{AutonomyMode, BudgetPolicy, TractConfig};
pub use content::{Content, ContentRegistry, CustomContentType, DialogueRole};
pub use engine::compile::{CompileOptions, CompiledContext, CompiledMessage};
pub use engine::tokens::{BpeTokenCounter, NullTokenCounter, TokenCounter};
pub use errors::{LLMError, Result, TractError};
pub use llm::{ChatMessage, ChatOptions, ChatResponse, LLMClient, Resolution, Resolver};
pub use model::{CommitInfo, GenerationConfig, Operation, Priority, RetentionCriteria};
pub use tract::{CommitOptions, CompressionOutcome, Tract};
