//! OpenAI-compatible backend implementation.

use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use dealgraph_core::{
    Capability, Completion, Embeddings, Error, InferenceBackend, ModelSettings, Prompt, Provider,
    Result, UsageMetrics, Vector,
};

use super::error::to_dealgraph_error;
use super::types::*;

/// Connection details for one OpenAI-compatible model.
#[derive(Debug, Clone)]
pub struct OpenAIConfig {
    /// Provider this endpoint belongs to (drives error labels and usage rows).
    pub provider: Provider,
    /// Base URL including the version segment, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    /// Bearer token; `None` for local endpoints.
    pub api_key: Option<String>,
    pub model: String,
    /// Embedding-only endpoints (Voyage) reject chat calls up front.
    pub embedding_only: bool,
}

impl OpenAIConfig {
    pub fn new(provider: Provider, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider,
            base_url: base_url.into(),
            api_key: None,
            model: model.into(),
            embedding_only: provider == Provider::Voyage,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }
}

/// Backend for any endpoint speaking the OpenAI chat/embeddings dialect.
pub struct OpenAIBackend {
    client: Client,
    config: OpenAIConfig,
}

impl OpenAIBackend {
    /// Create a backend over a shared, pre-configured HTTP client.
    pub fn new(config: OpenAIConfig, client: Client) -> Self {
        debug!(
            subsystem = "inference",
            component = "openai",
            provider = %config.provider,
            model = %config.model,
            base_url = %config.base_url,
            "Initializing OpenAI-compatible backend"
        );
        Self { client, config }
    }

    pub fn config(&self) -> &OpenAIConfig {
        &self.config
    }

    fn build_request(&self, endpoint: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), endpoint);
        let mut req = self.client.post(&url);

        if let Some(ref api_key) = self.config.api_key {
            req = req.bearer_auth(api_key);
        }

        req.header("Content-Type", "application/json")
    }

    async fn error_from(&self, response: reqwest::Response) -> Error {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        to_dealgraph_error(self.config.provider, status, &body)
    }
}

#[async_trait]
impl InferenceBackend for OpenAIBackend {
    fn provider(&self) -> Provider {
        self.config.provider
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }

    fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Embedding => true,
            Capability::Generation => !self.config.embedding_only,
        }
    }

    async fn generate(&self, prompt: &Prompt, settings: &ModelSettings) -> Result<Completion> {
        if self.config.embedding_only {
            return Err(Error::Configuration(format!(
                "{}:{} is an embedding-only model",
                self.config.provider, self.config.model
            )));
        }

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = prompt.system.as_deref().filter(|s| !s.is_empty()) {
            messages.push(ChatMessage::new("system", system));
        }
        messages.push(ChatMessage::new("user", prompt.user.as_str()));

        let request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages,
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            response_format: prompt.json_output.then(ResponseFormat::json_object),
        };

        debug!(
            subsystem = "inference",
            component = "openai",
            op = "generate",
            model = %self.config.model,
            prompt_len = prompt.user.len(),
            "Sending chat completion"
        );

        let start = Instant::now();
        let response = self
            .build_request("/chat/completions")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }

        let result: ChatCompletionResponse = response.json().await?;
        let latency_ms = start.elapsed().as_millis() as u64;

        let choice = result.choices.into_iter().next().ok_or_else(|| {
            Error::Provider(format!(
                "{} returned no choices for {}",
                self.config.provider, self.config.model
            ))
        })?;
        if choice.finish_reason.as_deref() == Some("length") {
            warn!(
                subsystem = "inference",
                component = "openai",
                model = %self.config.model,
                max_tokens = settings.max_tokens,
                "Completion truncated at max_tokens"
            );
        }

        let usage = result.usage.unwrap_or_default();
        Ok(Completion {
            text: choice.message.content.unwrap_or_default(),
            usage: UsageMetrics {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                latency_ms,
            },
        })
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Embeddings> {
        if texts.is_empty() {
            return Ok(Embeddings {
                vectors: vec![],
                usage: UsageMetrics::default(),
            });
        }

        let request = EmbeddingRequest {
            model: self.config.model.clone(),
            input: texts.to_vec(),
            // Voyage rejects "float"; it is the default there anyway.
            encoding_format: (self.config.provider != Provider::Voyage)
                .then(|| "float".to_string()),
        };

        let start = Instant::now();
        let response = self.build_request("/embeddings").json(&request).send().await?;

        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }

        let result: EmbeddingResponse = response.json().await?;
        let latency_ms = start.elapsed().as_millis() as u64;

        let mut data = result.data;
        if data.len() != texts.len() {
            return Err(Error::Embedding(format!(
                "{} returned {} embeddings for {} inputs",
                self.config.provider,
                data.len(),
                texts.len()
            )));
        }
        data.sort_by_key(|d| d.index);

        debug!(
            subsystem = "inference",
            component = "openai",
            op = "embed_texts",
            model = %self.config.model,
            input_count = texts.len(),
            duration_ms = latency_ms,
            "Embeddings generated"
        );

        Ok(Embeddings {
            vectors: data.into_iter().map(|d| Vector::from(d.embedding)).collect(),
            usage: UsageMetrics {
                input_tokens: result.usage.unwrap_or_default().input_tokens(),
                output_tokens: 0,
                latency_ms,
            },
        })
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/models", self.config.base_url.trim_end_matches('/'));
        let mut req = self.client.get(&url);
        if let Some(ref api_key) = self.config.api_key {
            req = req.bearer_auth(api_key);
        }
        match req.send().await {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(e) => {
                warn!(
                    subsystem = "inference",
                    provider = %self.config.provider,
                    error = %e,
                    "Health check failed"
                );
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(provider: Provider) -> OpenAIBackend {
        OpenAIBackend::new(
            OpenAIConfig::new(provider, "http://localhost:9/v1", "test-model"),
            Client::new(),
        )
    }

    #[test]
    fn test_voyage_is_embedding_only() {
        let b = backend(Provider::Voyage);
        assert!(b.supports(Capability::Embedding));
        assert!(!b.supports(Capability::Generation));
    }

    #[test]
    fn test_openai_supports_both() {
        let b = backend(Provider::OpenAI);
        assert!(b.supports(Capability::Embedding));
        assert!(b.supports(Capability::Generation));
        assert_eq!(b.model_name(), "test-model");
        assert_eq!(b.provider(), Provider::OpenAI);
    }

    #[tokio::test]
    async fn test_generate_on_embedding_only_is_configuration_error() {
        let b = backend(Provider::Voyage);
        let err = b
            .generate(&Prompt::new("hi"), &ModelSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_empty_embed_makes_no_request() {
        // Port 9 is unreachable; an actual request would fail.
        let b = backend(Provider::OpenAI);
        let out = b.embed_texts(&[]).await.unwrap();
        assert!(out.vectors.is_empty());
        assert_eq!(out.usage, UsageMetrics::default());
    }
}
