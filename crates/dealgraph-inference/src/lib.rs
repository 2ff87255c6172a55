//! # dealgraph-inference
//!
//! Every LLM and embedding call in dealgraph goes through this crate.
//!
//! This crate provides:
//! - [`ModelResolver`]: `provider:model` ids to provider-specific handles
//! - OpenAI-compatible and Anthropic backends
//! - [`FallbackChain`]: single-hop primary/secondary switching on outages
//! - [`EmbeddingAdapter`]: batched embeddings through a chain
//! - [`AgentModels`]: YAML agent configuration and pricing table
//! - [`UsageLogger`]: non-failing per-call cost accounting
//!
//! # Feature Flags
//!
//! - `mock`: deterministic [`mock::MockBackend`] for downstream tests
//! - `integration`: tests against live providers

pub mod anthropic;
pub mod config;
pub mod embedding;
pub mod fallback;
pub mod openai;
pub mod provider;
pub mod usage;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use anthropic::AnthropicBackend;
pub use config::AgentModels;
pub use embedding::{EmbeddedTexts, EmbeddingAdapter, EmbeddingCall};
pub use fallback::{ChainOutput, FallbackChain, FallbackObserver};
pub use openai::{OpenAIBackend, OpenAIConfig};
pub use provider::{ModelHandle, ModelResolver, ProviderSettings};
pub use usage::UsageLogger;
