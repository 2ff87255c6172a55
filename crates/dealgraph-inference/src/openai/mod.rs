//! OpenAI-compatible inference backend.
//!
//! Serves every provider that speaks the OpenAI chat/embeddings dialect:
//!
//! - OpenAI cloud API
//! - Google Gemini (OpenAI compatibility endpoint)
//! - Voyage (embeddings only)
//! - Ollama (`/v1` compatibility mode)

mod backend;
mod error;
mod types;

pub use backend::{OpenAIBackend, OpenAIConfig};
pub use error::{to_dealgraph_error, OpenAIErrorCode};
pub use types::*;
