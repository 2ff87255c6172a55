//! Anthropic Messages API backend.

use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use dealgraph_core::{
    defaults, Capability, Completion, Embeddings, Error, InferenceBackend, ModelSettings, Prompt,
    Provider, Result, UsageMetrics,
};

use crate::openai::OpenAIErrorCode;

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: MessagesUsage,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorResponse {
    error: AnthropicError,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    #[serde(rename = "type", default)]
    error_type: String,
    message: String,
}

/// Generation-only backend for Claude models.
pub struct AnthropicBackend {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl AnthropicBackend {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    async fn error_from(&self, response: reqwest::Response) -> Error {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<AnthropicErrorResponse>(&body) {
            Ok(parsed) => {
                let code = OpenAIErrorCode::from_response(status, &parsed.error.error_type);
                format!("{}: {}", code.label(), parsed.error.message)
            }
            Err(_) => body,
        };
        Error::from_provider_status(Provider::Anthropic.as_str(), status, &message)
    }
}

#[async_trait]
impl InferenceBackend for AnthropicBackend {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn supports(&self, capability: Capability) -> bool {
        capability == Capability::Generation
    }

    async fn generate(&self, prompt: &Prompt, settings: &ModelSettings) -> Result<Completion> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            system: prompt.system.as_deref().filter(|s| !s.is_empty()),
            messages: vec![Message {
                role: "user",
                content: &prompt.user,
            }],
        };

        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let start = Instant::now();
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", defaults::ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }

        let result: MessagesResponse = response.json().await?;
        let latency_ms = start.elapsed().as_millis() as u64;

        let text: String = result
            .content
            .iter()
            .filter(|b| b.block_type == "text")
            .filter_map(|b| b.text.as_deref())
            .collect();

        debug!(
            subsystem = "inference",
            component = "anthropic",
            op = "generate",
            model = %self.model,
            stop_reason = ?result.stop_reason,
            duration_ms = latency_ms,
            "Message complete"
        );

        Ok(Completion {
            text,
            usage: UsageMetrics {
                input_tokens: result.usage.input_tokens,
                output_tokens: result.usage.output_tokens,
                latency_ms,
            },
        })
    }

    async fn embed_texts(&self, _texts: &[String]) -> Result<Embeddings> {
        Err(Error::Configuration(format!(
            "anthropic:{} does not provide embeddings",
            self.model
        )))
    }
}
