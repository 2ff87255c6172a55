//! Mock inference backend for deterministic testing.
//!
//! Embeddings are derived from a SHA-256 of the input, so identical text
//! always yields identical vectors. Failures can be scripted per call, per
//! prompt substring, or for every call.
//!
//! ```rust
//! use dealgraph_inference::mock::{MockBackend, MockFailure};
//!
//! let backend = MockBackend::new()
//!     .with_dimension(32)
//!     .with_fixed_response("{\"entities\": [], \"relationships\": []}")
//!     .failing_on_call(2, MockFailure::RateLimited);
//! assert_eq!(backend.generate_call_count(), 0);
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use dealgraph_core::{
    Capability, Completion, Embeddings, Error, InferenceBackend, ModelSettings, Prompt, Provider,
    Result, UsageMetrics, Vector,
};

/// Scripted failure kinds, each mapping to the error a real provider would raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// HTTP 429
    RateLimited,
    /// HTTP 503
    ServerError,
    Timeout,
    Connection,
    /// HTTP 401
    Unauthorized,
    /// HTTP 400
    BadRequest,
}

impl MockFailure {
    pub fn to_error(self, provider: Provider) -> Error {
        let p = provider.as_str();
        match self {
            Self::RateLimited => Error::from_provider_status(p, 429, "rate limit exceeded"),
            Self::ServerError => Error::from_provider_status(p, 503, "service unavailable"),
            Self::Timeout => Error::Timeout(format!("{} request timed out", p)),
            Self::Connection => Error::ProviderTransient(format!("{} connection refused", p)),
            Self::Unauthorized => Error::from_provider_status(p, 401, "invalid api key"),
            Self::BadRequest => Error::from_provider_status(p, 400, "malformed request"),
        }
    }
}

type Responder = Arc<dyn Fn(&Prompt) -> String + Send + Sync>;

#[derive(Clone)]
pub struct MockBackend {
    provider: Provider,
    model: String,
    dimension: usize,
    generation: bool,
    embedding: bool,
    default_response: String,
    responder: Option<Responder>,
    always_fail: Option<MockFailure>,
    fail_on_call: HashMap<usize, MockFailure>,
    fail_when_contains: Vec<(String, MockFailure)>,
    latency: Option<Duration>,
    generate_calls: Arc<AtomicUsize>,
    embed_calls: Arc<AtomicUsize>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            provider: Provider::OpenAI,
            model: "mock-model".to_string(),
            dimension: 16,
            generation: true,
            embedding: true,
            default_response: "Mock response".to_string(),
            responder: None,
            always_fail: None,
            fail_on_call: HashMap::new(),
            fail_when_contains: Vec::new(),
            latency: None,
            generate_calls: Arc::new(AtomicUsize::new(0)),
            embed_calls: Arc::new(AtomicUsize::new(0)),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_identity(mut self, provider: Provider, model: impl Into<String>) -> Self {
        self.provider = provider;
        self.model = model.into();
        self
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn embedding_only(mut self) -> Self {
        self.generation = false;
        self.embedding = true;
        self
    }

    pub fn generation_only(mut self) -> Self {
        self.generation = true;
        self.embedding = false;
        self
    }

    pub fn with_fixed_response(mut self, response: impl Into<String>) -> Self {
        self.default_response = response.into();
        self
    }

    /// Compute each response from the prompt.
    pub fn with_responder(
        mut self,
        responder: impl Fn(&Prompt) -> String + Send + Sync + 'static,
    ) -> Self {
        self.responder = Some(Arc::new(responder));
        self
    }

    pub fn failing_always(mut self, failure: MockFailure) -> Self {
        self.always_fail = Some(failure);
        self
    }

    /// Fail the `n`th call (1-based, counting generate and embed calls separately).
    pub fn failing_on_call(mut self, n: usize, failure: MockFailure) -> Self {
        self.fail_on_call.insert(n, failure);
        self
    }

    /// Fail any call whose prompt or input text contains `needle`.
    pub fn failing_when_contains(mut self, needle: impl Into<String>, failure: MockFailure) -> Self {
        self.fail_when_contains.push((needle.into(), failure));
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn generate_call_count(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn embed_call_count(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    /// User prompts seen by `generate`, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|p| p.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// The deterministic vector this mock produces for `text`.
    pub fn vector_for(&self, text: &str) -> Vector {
        let digest = Sha256::digest(text.as_bytes());
        let mut values: Vec<f32> = (0..self.dimension)
            .map(|i| {
                let byte = digest[i % digest.len()] as f32;
                let round = (i / digest.len()) as f32;
                ((byte + round * 37.0) % 256.0) / 128.0 - 1.0
            })
            .collect();
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            values.iter_mut().for_each(|v| *v /= norm);
        }
        Vector::from(values)
    }

    fn scripted_failure(&self, call_no: usize, inputs: &[&str]) -> Option<Error> {
        let failure = self.always_fail.or_else(|| self.fail_on_call.get(&call_no).copied()).or_else(|| {
            self.fail_when_contains
                .iter()
                .find(|(needle, _)| inputs.iter().any(|i| i.contains(needle.as_str())))
                .map(|(_, f)| *f)
        })?;
        Some(failure.to_error(self.provider))
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn approx_tokens(chars: usize) -> u64 {
    (chars / 4).max(1) as u64
}

#[async_trait]
impl InferenceBackend for MockBackend {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Generation => self.generation,
            Capability::Embedding => self.embedding,
        }
    }

    async fn generate(&self, prompt: &Prompt, _settings: &ModelSettings) -> Result<Completion> {
        let call_no = self.generate_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.user.clone());
        }
        self.simulate_latency().await;

        if !self.generation {
            return Err(Error::Configuration(format!(
                "{}:{} does not support generation",
                self.provider, self.model
            )));
        }
        if let Some(err) = self.scripted_failure(call_no, &[prompt.user.as_str()]) {
            return Err(err);
        }

        let text = match &self.responder {
            Some(responder) => responder(prompt),
            None => self.default_response.clone(),
        };
        let prompt_chars =
            prompt.user.len() + prompt.system.as_deref().map(str::len).unwrap_or_default();
        Ok(Completion {
            usage: UsageMetrics {
                input_tokens: approx_tokens(prompt_chars),
                output_tokens: approx_tokens(text.len()),
                latency_ms: self.latency.map(|l| l.as_millis() as u64).unwrap_or(1),
            },
            text,
        })
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Embeddings> {
        let call_no = self.embed_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.simulate_latency().await;

        if !self.embedding {
            return Err(Error::Configuration(format!(
                "{}:{} does not provide embeddings",
                self.provider, self.model
            )));
        }
        let inputs: Vec<&str> = texts.iter().map(String::as_str).collect();
        if let Some(err) = self.scripted_failure(call_no, &inputs) {
            return Err(err);
        }

        let chars: usize = texts.iter().map(String::len).sum();
        Ok(Embeddings {
            vectors: texts.iter().map(|t| self.vector_for(t)).collect(),
            usage: UsageMetrics {
                input_tokens: approx_tokens(chars),
                output_tokens: 0,
                latency_ms: self.latency.map(|l| l.as_millis() as u64).unwrap_or(1),
            },
        })
    }
}
