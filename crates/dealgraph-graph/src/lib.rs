//! # dealgraph-graph
//!
//! Document-to-knowledge-graph ingestion: episodes from chunks, LLM
//! extraction constrained to a [`GraphSchema`](dealgraph_core::GraphSchema),
//! and the [`IngestionService`] that writes them to a namespaced
//! [`GraphStore`](dealgraph_core::GraphStore).

pub mod episode;
pub mod extraction;
pub mod ingestion;

pub use episode::{build_episode, episode_name, source_description};
pub use extraction::{build_extraction_prompt, json_object_slice, parse_extraction};
pub use ingestion::{IngestionConfig, IngestionService};
