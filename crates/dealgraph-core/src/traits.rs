//! Core traits for dealgraph collaborators.
//!
//! The pipeline only talks to storage, the graph and model providers through
//! these interfaces, so every layer can be exercised with in-memory fakes.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// INFERENCE BACKENDS
// =============================================================================

/// What a backend can be asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Generation,
    Embedding,
}

/// A concrete model behind one provider.
///
/// Backends report usage metrics with every call so the caller can log cost
/// without a second round trip.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn provider(&self) -> Provider;

    /// Model name without the provider prefix.
    fn model_name(&self) -> &str;

    fn supports(&self, capability: Capability) -> bool;

    /// Generate a completion for the prompt with the given sampling settings.
    async fn generate(&self, prompt: &Prompt, settings: &ModelSettings) -> Result<Completion>;

    /// Embed each text; returns one vector per input, in order.
    async fn embed_texts(&self, texts: &[String]) -> Result<Embeddings>;

    /// Check if the backend is reachable.
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

// =============================================================================
// JOB QUEUE
// =============================================================================

/// Durable stage job queue.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Queue a stage job.
    ///
    /// Idempotent per document: if a pending or running job for the same
    /// `(document_id, stage)` exists, its id is returned and nothing is inserted.
    async fn enqueue(
        &self,
        stage: PipelineStage,
        document_id: Option<Uuid>,
        payload: JsonValue,
    ) -> Result<Uuid>;

    /// Atomically claim the oldest runnable job whose stage is in `stages`.
    async fn claim_next(&self, stages: &[PipelineStage]) -> Result<Option<Job>>;

    async fn complete(&self, job_id: Uuid) -> Result<()>;

    /// Hand the job back to the queue, runnable again after `delay`.
    async fn retry_later(&self, job_id: Uuid, error: &str, delay: Duration) -> Result<()>;

    /// Mark the job permanently failed.
    async fn fail(&self, job_id: Uuid, error: &str) -> Result<()>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// Jobs waiting to run (including delayed retries).
    async fn pending_count(&self) -> Result<i64>;
}

// =============================================================================
// DOCUMENTS
// =============================================================================

/// The slice of the relational store the pipeline needs.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Fails with `DocumentNotFound` when absent.
    async fn get_document(&self, id: Uuid) -> Result<Document>;

    /// Chunks for a document, ordered by `chunk_index`.
    async fn get_chunks(&self, document_id: Uuid) -> Result<Vec<Chunk>>;

    async fn update_status(&self, id: Uuid, status: DocumentStatus) -> Result<()>;

    async fn clear_error(&self, id: Uuid) -> Result<()>;

    /// Record a permanent failure: status becomes `error` with `message`.
    async fn set_error(&self, id: Uuid, message: &str) -> Result<()>;

    async fn set_summary(&self, id: Uuid, summary: &str) -> Result<()>;

    async fn list_for_deal(&self, namespace: &Namespace) -> Result<Vec<Document>>;

    /// Ids of chunks of this document that already have an embedding.
    async fn embedded_chunk_ids(&self, document_id: Uuid) -> Result<Vec<Uuid>>;

    async fn store_chunk_embedding(&self, chunk_id: Uuid, vector: &Vector, model: &str)
        -> Result<()>;
}

// =============================================================================
// STAGE STATE
// =============================================================================

#[async_trait]
pub trait StageRepository: Send + Sync {
    async fn get(&self, document_id: Uuid) -> Result<Option<StageState>>;

    async fn upsert(&self, state: &StageState) -> Result<()>;
}

// =============================================================================
// USAGE
// =============================================================================

#[async_trait]
pub trait UsageRepository: Send + Sync {
    /// Append a usage record, returning its id.
    async fn insert_usage_record(&self, record: &UsageRecord) -> Result<Uuid>;
}

// =============================================================================
// KNOWLEDGE GRAPH
// =============================================================================

/// Namespaced knowledge graph.
///
/// Writes merge on `(namespace, episode name)` and `(namespace, normalized
/// entity name)`, so resubmitting an episode is idempotent. Nothing written in
/// one namespace is visible from another.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn add_episode(&self, write: &EpisodeWrite, schema: &GraphSchema) -> Result<()>;

    async fn search(&self, namespace: &Namespace, query: &GraphQuery) -> Result<Vec<GraphHit>>;

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}
