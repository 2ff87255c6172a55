//! Embedding adapter over the embedding agent's fallback chain.

use std::sync::Arc;

use tracing::{debug, info};

use dealgraph_core::{
    defaults, Error, ModelId, Result, UsageContext, UsageMetrics, Vector,
};

use crate::fallback::FallbackChain;
use crate::provider::ModelHandle;
use crate::usage::UsageLogger;

/// One provider request made while embedding a list of texts.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingCall {
    pub served_by: ModelId,
    pub usage: UsageMetrics,
    pub fell_back: bool,
    /// Number of vectors this request produced.
    pub count: usize,
}

/// Vectors in input order plus the provider requests that produced them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbeddedTexts {
    pub vectors: Vec<Vector>,
    pub calls: Vec<EmbeddingCall>,
}

impl EmbeddedTexts {
    pub fn fell_back(&self) -> bool {
        self.calls.iter().any(|c| c.fell_back)
    }

    /// The model that produced each vector, in input order.
    pub fn models(&self) -> impl Iterator<Item = &ModelId> + '_ {
        self.calls
            .iter()
            .flat_map(|c| std::iter::repeat(&c.served_by).take(c.count))
    }

    /// Write one usage record per provider request.
    pub async fn log_usage(&self, usage: &UsageLogger, feature: &str, context: &UsageContext) {
        for call in &self.calls {
            usage.log(&call.usage, &call.served_by, feature, context).await;
        }
    }
}

/// Batches texts through the embedding chain and optionally records usage.
pub struct EmbeddingAdapter {
    chain: Arc<FallbackChain>,
    usage: Option<Arc<UsageLogger>>,
    batch_size: usize,
}

impl EmbeddingAdapter {
    pub fn new(chain: Arc<FallbackChain>) -> Self {
        Self {
            chain,
            usage: None,
            batch_size: defaults::EMBED_BATCH_SIZE,
        }
    }

    pub fn with_usage_logger(mut self, usage: Arc<UsageLogger>) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Texts sent per provider request.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn chain(&self) -> &FallbackChain {
        &self.chain
    }

    /// Embed texts, logging usage under the `embedding` feature.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vector>> {
        self.embed_for(texts, defaults::FEATURE_EMBEDDING, &UsageContext::default())
            .await
    }

    /// Embed texts, logging usage under `feature` with the caller's context.
    pub async fn embed_for(
        &self,
        texts: &[String],
        feature: &str,
        context: &UsageContext,
    ) -> Result<Vec<Vector>> {
        let out = self.embed_with_usage(texts).await?;
        if let Some(usage) = &self.usage {
            out.log_usage(usage, feature, context).await;
        }
        Ok(out.vectors)
    }

    /// Embed texts without logging; the caller records `calls` itself.
    ///
    /// Each batch is a separate chain call and may be served by a different
    /// model. Empty input returns immediately without a provider call.
    pub async fn embed_with_usage(&self, texts: &[String]) -> Result<EmbeddedTexts> {
        let mut combined = EmbeddedTexts {
            vectors: Vec::with_capacity(texts.len()),
            calls: Vec::new(),
        };
        if texts.is_empty() {
            return Ok(combined);
        }

        for batch in texts.chunks(self.batch_size) {
            let out = self.chain.embed(batch).await?;
            if out.output.len() != batch.len() {
                return Err(Error::Embedding(format!(
                    "{} returned {} vectors for {} texts",
                    out.served_by,
                    out.output.len(),
                    batch.len()
                )));
            }
            combined.calls.push(EmbeddingCall {
                served_by: out.served_by,
                usage: out.usage,
                fell_back: out.fell_back,
                count: batch.len(),
            });
            combined.vectors.extend(out.output);
        }

        debug!(
            subsystem = "inference",
            component = "embedding",
            op = "embed",
            input_count = texts.len(),
            call_count = combined.calls.len(),
            fell_back = combined.fell_back(),
            "Embedded texts"
        );
        Ok(combined)
    }

    /// Probe every model in the chain and compare its vector width with
    /// `expected`. Vectors from either model land in the same column, so a
    /// mismatch on the secondary is as fatal as one on the primary.
    ///
    /// A width mismatch returns `Configuration` at once. Any other failure,
    /// such as an unreachable provider, is returned only after the remaining
    /// models have been checked.
    pub async fn verify_dimension(&self, expected: usize) -> Result<()> {
        let mut deferred = None;
        let handles = std::iter::once(self.chain.primary()).chain(self.chain.secondary());
        for handle in handles {
            match verify_handle(handle, expected).await {
                Ok(()) => {}
                Err(e @ Error::Configuration(_)) => return Err(e),
                Err(e) => {
                    deferred.get_or_insert(e);
                }
            }
        }
        deferred.map_or(Ok(()), Err)
    }
}

async fn verify_handle(handle: &ModelHandle, expected: usize) -> Result<()> {
    let out = handle.embed(&["dimension check".to_string()]).await?;
    let actual = out.vectors.first().map(|v| v.as_slice().len()).unwrap_or(0);
    if actual != expected {
        return Err(Error::Configuration(format!(
            "{} produces {}-dimensional vectors, expected {}",
            handle.id(),
            actual,
            expected
        )));
    }
    info!(
        subsystem = "inference",
        component = "embedding",
        model = %handle.id(),
        dimension = actual,
        "Embedding dimension verified"
    );
    Ok(())
}
