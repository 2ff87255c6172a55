//! Document-to-graph ingestion.
//!
//! One episode per chunk, processed sequentially in `chunk_index` order.
//! Any chunk error fails the whole call. Writes already made for earlier
//! chunks stay in the graph; a retried ingestion resubmits every chunk and
//! relies on the store merging on episode name and normalized entity name.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument};
use uuid::Uuid;

use dealgraph_core::{
    defaults, Chunk, EpisodeWrite, Error, GraphSchema, GraphStore, IngestionResult, Namespace,
    Result, UsageContext, Vector,
};
use dealgraph_inference::{EmbeddingAdapter, FallbackChain, UsageLogger};

use crate::episode::build_episode;
use crate::extraction::{build_extraction_prompt, parse_extraction};

/// Ingestion tuning.
///
/// | Env Variable | Default | Description |
/// |--------------|---------|-------------|
/// | `INGEST_PROGRESS_EVERY` | 10 | Log progress every N chunks |
#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub progress_every: usize,
    pub schema: GraphSchema,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            progress_every: defaults::INGEST_PROGRESS_EVERY,
            schema: GraphSchema::due_diligence(),
        }
    }
}

impl IngestionConfig {
    pub fn from_env() -> Self {
        let progress_every = std::env::var("INGEST_PROGRESS_EVERY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults::INGEST_PROGRESS_EVERY);
        Self {
            progress_every,
            ..Self::default()
        }
    }

    pub fn with_progress_every(mut self, every: usize) -> Self {
        self.progress_every = every.max(1);
        self
    }

    pub fn with_schema(mut self, schema: GraphSchema) -> Self {
        self.schema = schema;
        self
    }
}

/// Turns document chunks into namespaced graph episodes.
pub struct IngestionService {
    extraction: Arc<FallbackChain>,
    embeddings: Arc<EmbeddingAdapter>,
    graph: Arc<dyn GraphStore>,
    usage: Arc<UsageLogger>,
    config: IngestionConfig,
}

impl IngestionService {
    pub fn new(
        extraction: Arc<FallbackChain>,
        embeddings: Arc<EmbeddingAdapter>,
        graph: Arc<dyn GraphStore>,
        usage: Arc<UsageLogger>,
    ) -> Self {
        Self {
            extraction,
            embeddings,
            graph,
            usage,
            config: IngestionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: IngestionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn schema(&self) -> &GraphSchema {
        &self.config.schema
    }

    /// Ingest all chunks of one document into `namespace`.
    #[instrument(
        skip(self, chunks),
        fields(
            subsystem = "graph",
            component = "ingestion",
            op = "ingest",
            document_id = %document_id,
            namespace = %namespace,
            chunk_count = chunks.len(),
        )
    )]
    pub async fn ingest(
        &self,
        document_id: Uuid,
        namespace: &Namespace,
        document_name: &str,
        chunks: &[Chunk],
    ) -> Result<IngestionResult> {
        let start = Instant::now();
        let mut ordered: Vec<&Chunk> = chunks.iter().collect();
        ordered.sort_by_key(|c| c.chunk_index);

        let context = UsageContext::for_namespace(namespace);
        let total = ordered.len();
        let mut episode_count = 0usize;
        let mut total_chars = 0usize;

        for (position, chunk) in ordered.into_iter().enumerate() {
            if chunk.content.trim().is_empty() {
                debug!(chunk_index = chunk.chunk_index, "Skipping blank chunk");
                continue;
            }
            total_chars += chunk.content.chars().count();
            self.ingest_chunk(document_name, chunk, namespace, &context)
                .await?;
            episode_count += 1;

            let done = position + 1;
            if done % self.config.progress_every == 0 && done < total {
                info!(
                    document_id = %document_id,
                    processed = done,
                    total,
                    "Graph ingestion progress"
                );
            }
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let estimated_cost_usd = self.estimate_cost(total_chars);
        info!(
            document_id = %document_id,
            namespace = %namespace,
            episode_count,
            duration_ms = elapsed_ms,
            cost_usd = estimated_cost_usd,
            "Graph ingestion complete"
        );

        Ok(IngestionResult {
            episode_count,
            elapsed_ms,
            estimated_cost_usd,
        })
    }

    async fn ingest_chunk(
        &self,
        document_name: &str,
        chunk: &Chunk,
        namespace: &Namespace,
        context: &UsageContext,
    ) -> Result<()> {
        let episode = build_episode(document_name, chunk, namespace);

        let prompt = build_extraction_prompt(&episode, &self.config.schema);
        let completion = self.extraction.complete(&prompt).await?;
        self.usage
            .log(
                &completion.usage,
                &completion.served_by,
                defaults::FEATURE_GRAPH_EXTRACTION,
                context,
            )
            .await;
        let extraction = parse_extraction(&completion.output, &self.config.schema)?;

        let mut texts: Vec<String> = extraction
            .entities
            .iter()
            .map(|e| e.name.clone())
            .collect();
        texts.extend(extraction.relationships.iter().map(|r| r.fact.clone()));

        let embedded = self.embeddings.embed_with_usage(&texts).await?;
        embedded
            .log_usage(&self.usage, defaults::FEATURE_GRAPH_EMBEDDING, context)
            .await;
        let (entity_embeddings, fact_embeddings) =
            split_vectors(embedded.vectors, extraction.entities.len())?;

        debug!(
            episode = %episode.name,
            entities = extraction.entities.len(),
            relationships = extraction.relationships.len(),
            model = %completion.served_by,
            "Writing episode"
        );

        let write = EpisodeWrite {
            episode,
            extraction,
            entity_embeddings,
            fact_embeddings,
        };
        self.graph.add_episode(&write, &self.config.schema).await
    }

    /// Directional cost: chars/4 tokens at the embedding primary's input rate.
    fn estimate_cost(&self, total_chars: usize) -> f64 {
        let tokens = (total_chars / defaults::CHARS_PER_TOKEN) as f64;
        let primary = self.embeddings.chain().primary().id();
        self.usage
            .pricing()
            .get(primary)
            .map(|p| tokens * p.input_per_token())
            .unwrap_or(0.0)
    }
}

fn split_vectors(mut vectors: Vec<Vector>, entity_count: usize) -> Result<(Vec<Vector>, Vec<Vector>)> {
    if vectors.len() < entity_count {
        return Err(Error::Embedding(format!(
            "expected at least {} vectors, got {}",
            entity_count,
            vectors.len()
        )));
    }
    let facts = vectors.split_off(entity_count);
    Ok((vectors, facts))
}
