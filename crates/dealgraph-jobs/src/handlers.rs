//! Handlers for the four pipeline stages.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, instrument};

use dealgraph_core::{
    defaults, Chunk, DocumentRepository, Error, PipelineStage, Prompt, Result, UsageContext,
};
use dealgraph_graph::IngestionService;
use dealgraph_inference::{EmbeddingAdapter, FallbackChain, UsageLogger};

use crate::handler::{JobContext, JobHandler, JobResult};

/// Collaborators shared by the stage handlers, built once at startup.
#[derive(Clone)]
pub struct PipelineDeps {
    pub documents: Arc<dyn DocumentRepository>,
    pub embeddings: Arc<EmbeddingAdapter>,
    pub ingestion: Arc<IngestionService>,
    /// `document_analysis` agent chain.
    pub analysis: Arc<FallbackChain>,
    pub usage: Arc<UsageLogger>,
}

impl PipelineDeps {
    /// One handler per stage, in pipeline order.
    pub fn handlers(&self) -> Vec<Arc<dyn JobHandler>> {
        vec![
            Arc::new(ParseHandler::new(self.documents.clone())),
            Arc::new(EmbedHandler::new(
                self.documents.clone(),
                self.embeddings.clone(),
                self.usage.clone(),
            )),
            Arc::new(GraphIngestHandler::new(
                self.documents.clone(),
                self.ingestion.clone(),
            )),
            Arc::new(AnalyzeHandler::new(
                self.documents.clone(),
                self.analysis.clone(),
                self.usage.clone(),
            )),
        ]
    }
}

// =============================================================================
// PARSE
// =============================================================================

/// Confirms the upstream parser left chunks behind.
///
/// Parsing and chunking happen outside the pipeline; a document that reaches
/// this stage with no chunks can never progress, so it fails permanently.
pub struct ParseHandler {
    documents: Arc<dyn DocumentRepository>,
}

impl ParseHandler {
    pub fn new(documents: Arc<dyn DocumentRepository>) -> Self {
        Self { documents }
    }

    async fn run(&self, ctx: &JobContext) -> Result<Option<JsonValue>> {
        let chunks = self.documents.get_chunks(ctx.document_id()).await?;
        if chunks.iter().all(|c| c.content.trim().is_empty()) {
            return Err(Error::InvalidInput(format!(
                "document {} has no content chunks",
                ctx.document_id()
            )));
        }
        ctx.report_progress(100, Some("Chunks verified"));
        Ok(Some(json!({ "chunk_count": chunks.len() })))
    }
}

#[async_trait]
impl JobHandler for ParseHandler {
    fn stage(&self) -> PipelineStage {
        PipelineStage::Parse
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        self.run(&ctx).await.into()
    }
}

// =============================================================================
// EMBED
// =============================================================================

/// Embeds chunk content and stores one vector per chunk.
///
/// Vectors are stored batch by batch, so a retry only embeds the chunks the
/// failed attempt did not reach.
pub struct EmbedHandler {
    documents: Arc<dyn DocumentRepository>,
    embeddings: Arc<EmbeddingAdapter>,
    usage: Arc<UsageLogger>,
}

impl EmbedHandler {
    pub fn new(
        documents: Arc<dyn DocumentRepository>,
        embeddings: Arc<EmbeddingAdapter>,
        usage: Arc<UsageLogger>,
    ) -> Self {
        Self {
            documents,
            embeddings,
            usage,
        }
    }

    #[instrument(
        skip(self, ctx),
        fields(subsystem = "jobs", component = "embed_handler", document_id = %ctx.document_id())
    )]
    async fn run(&self, ctx: &JobContext) -> Result<Option<JsonValue>> {
        let document_id = ctx.document_id();
        let chunks = self.documents.get_chunks(document_id).await?;

        let done: HashSet<_> = if ctx.is_retry {
            self.documents
                .embedded_chunk_ids(document_id)
                .await?
                .into_iter()
                .collect()
        } else {
            HashSet::new()
        };
        let pending: Vec<&Chunk> = chunks
            .iter()
            .filter(|c| !c.content.trim().is_empty() && !done.contains(&c.id))
            .collect();
        if !done.is_empty() {
            debug!(skipped = done.len(), "Skipping chunks embedded by an earlier attempt");
        }

        let context = UsageContext::for_namespace(&ctx.namespace);
        let total = pending.len().max(1);
        let mut embedded = 0usize;
        for batch in pending.chunks(self.embeddings.batch_size()) {
            let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
            let out = self.embeddings.embed_with_usage(&texts).await?;
            if out.vectors.len() != batch.len() {
                return Err(Error::Embedding(format!(
                    "embedding returned {} vectors for {} chunks",
                    out.vectors.len(),
                    batch.len()
                )));
            }
            out.log_usage(&self.usage, defaults::FEATURE_EMBEDDING, &context)
                .await;

            for ((chunk, vector), model) in batch.iter().zip(&out.vectors).zip(out.models()) {
                self.documents
                    .store_chunk_embedding(chunk.id, vector, &model.to_string())
                    .await?;
            }
            embedded += batch.len();
            ctx.report_progress((embedded * 100 / total) as i32, None);
        }

        info!(
            chunk_count = chunks.len(),
            embedded,
            skipped = done.len(),
            "Chunks embedded"
        );
        Ok(Some(json!({ "embedded": embedded, "skipped": done.len() })))
    }
}

#[async_trait]
impl JobHandler for EmbedHandler {
    fn stage(&self) -> PipelineStage {
        PipelineStage::Embed
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        self.run(&ctx).await.into()
    }
}

// =============================================================================
// GRAPH INGEST
// =============================================================================

/// Runs the ingestion service over every chunk of the document.
///
/// Retries resubmit all chunks; the graph store merges on episode and entity
/// keys, so episodes written by a failed attempt are not duplicated.
pub struct GraphIngestHandler {
    documents: Arc<dyn DocumentRepository>,
    ingestion: Arc<IngestionService>,
}

impl GraphIngestHandler {
    pub fn new(documents: Arc<dyn DocumentRepository>, ingestion: Arc<IngestionService>) -> Self {
        Self {
            documents,
            ingestion,
        }
    }

    async fn run(&self, ctx: &JobContext) -> Result<Option<JsonValue>> {
        let chunks = self.documents.get_chunks(ctx.document_id()).await?;
        let result = self
            .ingestion
            .ingest(ctx.document_id(), &ctx.namespace, &ctx.document.name, &chunks)
            .await?;
        ctx.report_progress(100, Some("Graph ingestion complete"));
        Ok(Some(json!({
            "episode_count": result.episode_count,
            "elapsed_ms": result.elapsed_ms,
            "estimated_cost_usd": result.estimated_cost_usd,
        })))
    }
}

#[async_trait]
impl JobHandler for GraphIngestHandler {
    fn stage(&self) -> PipelineStage {
        PipelineStage::GraphIngest
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        self.run(&ctx).await.into()
    }
}

// =============================================================================
// ANALYZE
// =============================================================================

const ANALYSIS_SYSTEM_PROMPT: &str = "You are a due diligence analyst. Summarize the document \
for a deal team: what it is, the parties involved, key financial figures, obligations, and \
anything that looks like a risk. Be factual and concise. Reply in plain prose.";

/// Truncate to at most `max_chars` characters on a char boundary.
fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Build the analysis prompt from the first chunks of the document.
pub fn build_analysis_prompt(document_name: &str, chunks: &[Chunk]) -> Prompt {
    let body = chunks
        .iter()
        .map(|c| c.content.trim())
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    let body = truncate_chars(&body, defaults::ANALYSIS_MAX_CHARS);
    Prompt::new(format!("Document: {}\n\n{}", document_name, body))
        .with_system(ANALYSIS_SYSTEM_PROMPT)
}

/// Writes a document summary through the `document_analysis` chain.
pub struct AnalyzeHandler {
    documents: Arc<dyn DocumentRepository>,
    analysis: Arc<FallbackChain>,
    usage: Arc<UsageLogger>,
}

impl AnalyzeHandler {
    pub fn new(
        documents: Arc<dyn DocumentRepository>,
        analysis: Arc<FallbackChain>,
        usage: Arc<UsageLogger>,
    ) -> Self {
        Self {
            documents,
            analysis,
            usage,
        }
    }

    async fn run(&self, ctx: &JobContext) -> Result<Option<JsonValue>> {
        let document_id = ctx.document_id();
        if ctx.is_retry && ctx.document.summary.is_some() {
            debug!(
                subsystem = "jobs",
                component = "analyze_handler",
                document_id = %document_id,
                "Summary already stored by an earlier attempt"
            );
            return Ok(Some(json!({ "skipped": true })));
        }

        let chunks = self.documents.get_chunks(document_id).await?;
        let prompt = build_analysis_prompt(&ctx.document.name, &chunks);
        let out = self.analysis.complete(&prompt).await?;
        self.usage
            .log(
                &out.usage,
                &out.served_by,
                defaults::FEATURE_DOCUMENT_ANALYSIS,
                &UsageContext::for_namespace(&ctx.namespace),
            )
            .await;

        let summary = out.output.trim();
        if summary.is_empty() {
            return Err(Error::Provider(format!(
                "{} returned an empty summary",
                out.served_by
            )));
        }
        self.documents.set_summary(document_id, summary).await?;

        info!(
            subsystem = "jobs",
            component = "analyze_handler",
            document_id = %document_id,
            model = %out.served_by,
            summary_chars = summary.chars().count(),
            "Document summary stored"
        );
        Ok(Some(json!({ "model": out.served_by.to_string() })))
    }
}

#[async_trait]
impl JobHandler for AnalyzeHandler {
    fn stage(&self) -> PipelineStage {
        PipelineStage::Analyze
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        self.run(&ctx).await.into()
    }
}
