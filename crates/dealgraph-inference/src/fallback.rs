//! Single-hop primary/secondary model chain.
//!
//! | Primary outcome | Secondary configured | Result |
//! |-----------------|----------------------|--------|
//! | success | - | primary output, no event |
//! | provider-transient error | yes | one `FallbackEvent`, secondary called once |
//! | provider-transient error | no | original error |
//! | any other error | - | original error |
//!
//! The primary is never retried by the chain; job-level retry owns that.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use dealgraph_core::{FallbackEvent, ModelId, Prompt, Result, UsageMetrics, Vector};

use crate::provider::ModelHandle;

/// Callback invoked with every fallback event.
pub type FallbackObserver = Arc<dyn Fn(&FallbackEvent) + Send + Sync>;

/// Output of a chain call plus which model actually served it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainOutput<T> {
    pub output: T,
    pub usage: UsageMetrics,
    pub served_by: ModelId,
    pub fell_back: bool,
}

pub struct FallbackChain {
    primary: ModelHandle,
    secondary: Option<ModelHandle>,
    label: String,
    fallback_count: AtomicU64,
    observer: Option<FallbackObserver>,
}

impl FallbackChain {
    pub fn new(primary: ModelHandle, secondary: Option<ModelHandle>) -> Self {
        Self {
            primary,
            secondary,
            label: String::new(),
            fallback_count: AtomicU64::new(0),
            observer: None,
        }
    }

    /// A chain with no secondary; calls pass straight through.
    pub fn single(primary: ModelHandle) -> Self {
        Self::new(primary, None)
    }

    /// Agent name attached to log lines.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_observer(mut self, observer: FallbackObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn primary(&self) -> &ModelHandle {
        &self.primary
    }

    pub fn secondary(&self) -> Option<&ModelHandle> {
        self.secondary.as_ref()
    }

    /// Number of times this chain has switched to its secondary.
    pub fn fallback_count(&self) -> u64 {
        self.fallback_count.load(Ordering::Relaxed)
    }

    pub async fn complete(&self, prompt: &Prompt) -> Result<ChainOutput<String>> {
        self.invoke("complete", |handle| {
            let prompt = prompt.clone();
            Box::pin(async move {
                let completion = handle.generate(&prompt).await?;
                Ok((completion.text, completion.usage))
            })
        })
        .await
    }

    pub async fn embed(&self, texts: &[String]) -> Result<ChainOutput<Vec<Vector>>> {
        self.invoke("embed", |handle| {
            let texts = texts.to_vec();
            Box::pin(async move {
                let embeddings = handle.embed(&texts).await?;
                Ok((embeddings.vectors, embeddings.usage))
            })
        })
        .await
    }

    async fn invoke<T, F>(&self, op: &'static str, call: F) -> Result<ChainOutput<T>>
    where
        T: Send + 'static,
        F: Fn(ModelHandle) -> BoxFuture<'static, Result<(T, UsageMetrics)>>,
    {
        let err = match call(self.primary.clone()).await {
            Ok((output, usage)) => {
                return Ok(ChainOutput {
                    output,
                    usage,
                    served_by: self.primary.id().clone(),
                    fell_back: false,
                })
            }
            Err(err) => err,
        };

        let secondary = match &self.secondary {
            Some(secondary) if err.is_provider_transient() => secondary,
            _ => {
                debug!(
                    subsystem = "inference",
                    component = "fallback_chain",
                    op,
                    agent = %self.label,
                    model = %self.primary.id(),
                    transient = err.is_provider_transient(),
                    "Primary failed without fallback"
                );
                return Err(err);
            }
        };

        let event = FallbackEvent {
            primary_model_id: self.primary.id().to_string(),
            fallback_model_id: secondary.id().to_string(),
            triggering_error: err.to_string(),
            timestamp: Utc::now(),
        };
        self.fallback_count.fetch_add(1, Ordering::Relaxed);
        warn!(
            subsystem = "inference",
            component = "fallback_chain",
            op,
            agent = %self.label,
            primary_model_id = %event.primary_model_id,
            fallback_model_id = %event.fallback_model_id,
            triggering_error = %event.triggering_error,
            "Primary model unavailable, falling back"
        );
        if let Some(observer) = &self.observer {
            observer(&event);
        }

        let (output, usage) = call(secondary.clone()).await?;
        Ok(ChainOutput {
            output,
            usage,
            served_by: secondary.id().clone(),
            fell_back: true,
        })
    }
}

impl std::fmt::Debug for FallbackChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackChain")
            .field("label", &self.label)
            .field("primary", self.primary.id())
            .field("secondary", &self.secondary.as_ref().map(|s| s.id()))
            .field("fallback_count", &self.fallback_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockFailure};
    use dealgraph_core::{Error, ModelSettings, Provider};
    use std::sync::Mutex;

    fn handle(provider: Provider, model: &str, backend: &MockBackend) -> ModelHandle {
        ModelHandle::new(
            ModelId::new(provider, model),
            ModelSettings::default(),
            Arc::new(backend.clone()),
        )
    }

    fn recording_chain(
        primary: &MockBackend,
        secondary: Option<&MockBackend>,
    ) -> (FallbackChain, Arc<Mutex<Vec<FallbackEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let chain = FallbackChain::new(
            handle(Provider::Google, "gemini-2.0-flash", primary),
            secondary.map(|b| handle(Provider::Anthropic, "claude-3-5-haiku-latest", b)),
        )
        .with_observer(Arc::new(move |e: &FallbackEvent| {
            sink.lock().unwrap().push(e.clone())
        }));
        (chain, events)
    }

    #[tokio::test]
    async fn test_primary_success_no_event() {
        let primary = MockBackend::new().with_fixed_response("primary");
        let secondary = MockBackend::new().with_fixed_response("secondary");
        let (chain, events) = recording_chain(&primary, Some(&secondary));

        let out = chain.complete(&Prompt::new("q")).await.unwrap();
        assert_eq!(out.output, "primary");
        assert!(!out.fell_back);
        assert_eq!(out.served_by.to_string(), "google:gemini-2.0-flash");
        assert_eq!(secondary.generate_call_count(), 0);
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(chain.fallback_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_falls_back_once() {
        let primary = MockBackend::new().failing_always(MockFailure::RateLimited);
        let secondary = MockBackend::new().with_fixed_response("secondary");
        let (chain, events) = recording_chain(&primary, Some(&secondary));

        let out = chain.complete(&Prompt::new("q")).await.unwrap();
        assert_eq!(out.output, "secondary");
        assert!(out.fell_back);
        assert_eq!(out.served_by.provider(), Provider::Anthropic);
        assert_eq!(primary.generate_call_count(), 1);
        assert_eq!(secondary.generate_call_count(), 1);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].primary_model_id, "google:gemini-2.0-flash");
        assert_eq!(events[0].fallback_model_id, "anthropic:claude-3-5-haiku-latest");
        assert!(events[0].triggering_error.contains("429"));
        assert_eq!(chain.fallback_count(), 1);
    }

    #[tokio::test]
    async fn test_secondary_failure_propagates_secondary_error() {
        let primary = MockBackend::new().failing_always(MockFailure::ServerError);
        let secondary = MockBackend::new().failing_always(MockFailure::Timeout);
        let (chain, events) = recording_chain(&primary, Some(&secondary));

        let err = chain.complete(&Prompt::new("q")).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "{err:?}");
        assert_eq!(primary.generate_call_count(), 1, "primary never retried");
        assert_eq!(secondary.generate_call_count(), 1);
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_does_not_fall_back() {
        let primary = MockBackend::new().failing_always(MockFailure::Unauthorized);
        let secondary = MockBackend::new().with_fixed_response("secondary");
        let (chain, events) = recording_chain(&primary, Some(&secondary));

        let err = chain.complete(&Prompt::new("q")).await.unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
        assert_eq!(secondary.generate_call_count(), 0);
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_secondary_propagates_original_error() {
        let primary = MockBackend::new().failing_always(MockFailure::ServerError);
        let (chain, events) = recording_chain(&primary, None);

        let err = chain.complete(&Prompt::new("q")).await.unwrap_err();
        assert!(matches!(err, Error::ProviderTransient(ref m) if m.contains("503")));
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(chain.fallback_count(), 0);
    }

    #[tokio::test]
    async fn test_embed_falls_back() {
        let primary = MockBackend::new().failing_always(MockFailure::Connection);
        let secondary = MockBackend::new().with_dimension(8);
        let (chain, _events) = recording_chain(&primary, Some(&secondary));

        let out = chain
            .embed(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert!(out.fell_back);
        assert_eq!(out.output.len(), 2);
        assert_eq!(out.output[0].as_slice().len(), 8);
        assert_eq!(secondary.embed_call_count(), 1);
    }
}
