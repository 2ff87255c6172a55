//! Model resolution from `provider:model` identifiers.
//!
//! ```text
//! "anthropic:claude-sonnet-4-0"      → Anthropic Messages backend
//! "openai:gpt-4o-mini"               → OpenAI-compatible (api.openai.com)
//! "google:gemini-2.0-flash"          → OpenAI-compatible (Gemini endpoint)
//! "ollama:qwen3:8b"                  → OpenAI-compatible (local /v1)
//! "voyage:voyage-finance-2"          → OpenAI-compatible, embeddings only
//! ```
//!
//! The provider set is closed. Adding one means a new [`Provider`] variant and
//! a new arm in [`ModelResolver::resolve_id`]; the compiler flags every other
//! place that must change.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tracing::{debug, info};

use dealgraph_core::{
    defaults, AgentType, Capability, Completion, Embeddings, Error, InferenceBackend, ModelConfig,
    ModelId, ModelSettings, Prompt, Provider, Result,
};

use crate::anthropic::AnthropicBackend;
use crate::fallback::FallbackChain;
use crate::openai::{OpenAIBackend, OpenAIConfig};

// ---------------------------------------------------------------------------
// Provider settings
// ---------------------------------------------------------------------------

/// Credentials, endpoints and HTTP limits for every provider.
///
/// # Environment Variables
///
/// | Variable | Default | Description |
/// |----------|---------|-------------|
/// | `ANTHROPIC_API_KEY` | (none) | Required to resolve `anthropic:*` |
/// | `OPENAI_API_KEY` | (none) | Required to resolve `openai:*` |
/// | `GOOGLE_API_KEY` | (none) | Required to resolve `google:*` |
/// | `VOYAGE_API_KEY` | (none) | Required to resolve `voyage:*` |
/// | `ANTHROPIC_BASE_URL` | `https://api.anthropic.com` | |
/// | `OPENAI_BASE_URL` | `https://api.openai.com/v1` | |
/// | `GOOGLE_BASE_URL` | Gemini OpenAI endpoint | |
/// | `VOYAGE_BASE_URL` | `https://api.voyageai.com/v1` | |
/// | `OLLAMA_BASE_URL` | `http://127.0.0.1:11434/v1` | No key needed |
/// | `PROVIDER_CONNECT_TIMEOUT_SECS` | `5` | TCP connect timeout |
/// | `PROVIDER_TIMEOUT_SECS` | `60` | Whole-request timeout |
#[derive(Clone)]
pub struct ProviderSettings {
    api_keys: HashMap<Provider, String>,
    base_urls: HashMap<Provider, String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Idle connections kept per host; sized to the worker pool.
    pub pool_max_idle_per_host: usize,
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("keys_configured", &self.api_keys.keys().collect::<Vec<_>>())
            .field("base_urls", &self.base_urls)
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("pool_max_idle_per_host", &self.pool_max_idle_per_host)
            .finish()
    }
}

impl Default for ProviderSettings {
    fn default() -> Self {
        let base_urls = Provider::ALL
            .into_iter()
            .map(|p| (p, default_base_url(p).to_string()))
            .collect();
        Self {
            api_keys: HashMap::new(),
            base_urls,
            connect_timeout: Duration::from_secs(defaults::PROVIDER_CONNECT_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(defaults::PROVIDER_TIMEOUT_SECS),
            pool_max_idle_per_host: defaults::JOB_MAX_CONCURRENT * 2,
        }
    }
}

fn default_base_url(provider: Provider) -> &'static str {
    match provider {
        Provider::Anthropic => defaults::ANTHROPIC_BASE_URL,
        Provider::OpenAI => defaults::OPENAI_BASE_URL,
        Provider::Google => defaults::GOOGLE_BASE_URL,
        Provider::Voyage => defaults::VOYAGE_BASE_URL,
        Provider::Ollama => defaults::OLLAMA_BASE_URL,
    }
}

fn env_prefix(provider: Provider) -> &'static str {
    match provider {
        Provider::Anthropic => "ANTHROPIC",
        Provider::OpenAI => "OPENAI",
        Provider::Google => "GOOGLE",
        Provider::Voyage => "VOYAGE",
        Provider::Ollama => "OLLAMA",
    }
}

/// Whether the provider needs an API key at all.
pub fn requires_api_key(provider: Provider) -> bool {
    !matches!(provider, Provider::Ollama)
}

impl ProviderSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup (used by tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Self::default();
        for provider in Provider::ALL {
            let prefix = env_prefix(provider);
            if let Some(key) = lookup(&format!("{}_API_KEY", prefix)).filter(|k| !k.is_empty()) {
                settings.api_keys.insert(provider, key);
            }
            if let Some(url) = lookup(&format!("{}_BASE_URL", prefix)).filter(|u| !u.is_empty()) {
                settings.base_urls.insert(provider, url);
            }
        }
        if let Some(secs) = lookup("PROVIDER_CONNECT_TIMEOUT_SECS").and_then(|s| s.parse().ok()) {
            settings.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = lookup("PROVIDER_TIMEOUT_SECS").and_then(|s| s.parse().ok()) {
            settings.request_timeout = Duration::from_secs(secs);
        }
        settings
    }

    pub fn with_api_key(mut self, provider: Provider, key: impl Into<String>) -> Self {
        self.api_keys.insert(provider, key.into());
        self
    }

    pub fn with_base_url(mut self, provider: Provider, url: impl Into<String>) -> Self {
        self.base_urls.insert(provider, url.into());
        self
    }

    /// Size the idle pool for `workers` concurrent jobs.
    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.pool_max_idle_per_host = workers.max(1) * 2;
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, request: Duration) -> Self {
        self.connect_timeout = connect;
        self.request_timeout = request;
        self
    }

    pub fn api_key(&self, provider: Provider) -> Option<&str> {
        self.api_keys.get(&provider).map(String::as_str)
    }

    pub fn base_url(&self, provider: Provider) -> &str {
        self.base_urls
            .get(&provider)
            .map(String::as_str)
            .unwrap_or_else(|| default_base_url(provider))
    }

    fn build_client(&self) -> Result<Client> {
        Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout)
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {}", e)))
    }
}

// ---------------------------------------------------------------------------
// Model handle
// ---------------------------------------------------------------------------

/// A resolved model: backend plus the agent's sampling settings.
#[derive(Clone)]
pub struct ModelHandle {
    id: ModelId,
    settings: ModelSettings,
    backend: Arc<dyn InferenceBackend>,
}

impl ModelHandle {
    pub fn new(id: ModelId, settings: ModelSettings, backend: Arc<dyn InferenceBackend>) -> Self {
        Self {
            id,
            settings,
            backend,
        }
    }

    pub fn id(&self) -> &ModelId {
        &self.id
    }

    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    pub fn backend(&self) -> &Arc<dyn InferenceBackend> {
        &self.backend
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.backend.supports(capability)
    }

    pub async fn generate(&self, prompt: &Prompt) -> Result<Completion> {
        self.backend.generate(prompt, &self.settings).await
    }

    pub async fn embed(&self, texts: &[String]) -> Result<Embeddings> {
        self.backend.embed_texts(texts).await
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("id", &self.id)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Turns model ids into handles. One HTTP client per provider, shared by
/// every handle the resolver produces.
pub struct ModelResolver {
    settings: ProviderSettings,
    clients: HashMap<Provider, Client>,
}

impl ModelResolver {
    pub fn new(settings: ProviderSettings) -> Result<Self> {
        let mut clients = HashMap::new();
        for provider in Provider::ALL {
            clients.insert(provider, settings.build_client()?);
        }
        info!(
            subsystem = "inference",
            component = "resolver",
            connect_timeout_secs = settings.connect_timeout.as_secs(),
            request_timeout_secs = settings.request_timeout.as_secs(),
            pool_max_idle_per_host = settings.pool_max_idle_per_host,
            "Model resolver initialized"
        );
        Ok(Self { settings, clients })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(ProviderSettings::from_env())
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    /// Parse and resolve a `provider:model` string.
    ///
    /// Malformed ids, unknown providers and missing credentials all fail with
    /// `Error::Configuration` before any network activity.
    pub fn resolve(&self, model_id: &str, settings: ModelSettings) -> Result<ModelHandle> {
        let id = ModelId::parse(model_id)?;
        self.resolve_id(&id, settings)
    }

    pub fn resolve_id(&self, id: &ModelId, settings: ModelSettings) -> Result<ModelHandle> {
        let provider = id.provider();
        let client = self.client(provider)?;
        let base_url = self.settings.base_url(provider).to_string();
        let api_key = self.settings.api_key(provider).map(str::to_string);

        if requires_api_key(provider) && api_key.is_none() {
            return Err(Error::Configuration(format!(
                "{}_API_KEY is not set; cannot resolve '{}'",
                env_prefix(provider),
                id
            )));
        }

        let backend: Arc<dyn InferenceBackend> = match provider {
            Provider::Anthropic => Arc::new(AnthropicBackend::new(
                client,
                base_url,
                api_key.unwrap_or_default(),
                id.model(),
            )),
            Provider::OpenAI | Provider::Google | Provider::Ollama | Provider::Voyage => {
                Arc::new(OpenAIBackend::new(
                    OpenAIConfig::new(provider, base_url, id.model()).with_api_key(api_key),
                    client,
                ))
            }
        };

        debug!(
            subsystem = "inference",
            component = "resolver",
            model = %id,
            temperature = settings.temperature,
            max_tokens = settings.max_tokens,
            "Resolved model"
        );

        Ok(ModelHandle::new(id.clone(), settings, backend))
    }

    /// Resolve and require a capability.
    pub fn resolve_for(
        &self,
        id: &ModelId,
        settings: ModelSettings,
        capability: Capability,
    ) -> Result<ModelHandle> {
        let handle = self.resolve_id(id, settings)?;
        if !handle.supports(capability) {
            return Err(Error::Configuration(format!(
                "'{}' does not support {}",
                id,
                match capability {
                    Capability::Generation => "generation",
                    Capability::Embedding => "embeddings",
                }
            )));
        }
        Ok(handle)
    }

    pub fn resolve_generation(&self, model_id: &str, settings: ModelSettings) -> Result<ModelHandle> {
        self.resolve_for(&ModelId::parse(model_id)?, settings, Capability::Generation)
    }

    pub fn resolve_embedding(&self, model_id: &str) -> Result<ModelHandle> {
        self.resolve_for(
            &ModelId::parse(model_id)?,
            ModelSettings::default(),
            Capability::Embedding,
        )
    }

    /// Build the primary/fallback chain for one agent.
    pub fn chain_for(&self, config: &ModelConfig) -> Result<FallbackChain> {
        let capability = match config.agent_type {
            AgentType::Embedding => Capability::Embedding,
            _ => Capability::Generation,
        };
        let primary = self.resolve_for(&config.primary_model_id, config.settings(), capability)?;
        let secondary = config
            .fallback_model_id
            .as_ref()
            .map(|id| self.resolve_for(id, config.settings(), capability))
            .transpose()?;
        Ok(FallbackChain::new(primary, secondary).with_label(config.agent_type.as_str()))
    }

    fn client(&self, provider: Provider) -> Result<Client> {
        self.clients
            .get(&provider)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("No HTTP client for {}", provider)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_keys() -> ProviderSettings {
        ProviderSettings::default()
            .with_api_key(Provider::Anthropic, "a")
            .with_api_key(Provider::OpenAI, "o")
            .with_api_key(Provider::Google, "g")
            .with_api_key(Provider::Voyage, "v")
    }

    #[test]
    fn test_resolve_each_provider() {
        let resolver = ModelResolver::new(all_keys()).unwrap();
        for (id, provider) in [
            ("anthropic:claude-sonnet-4-0", Provider::Anthropic),
            ("openai:gpt-4o-mini", Provider::OpenAI),
            ("google:gemini-2.0-flash", Provider::Google),
            ("voyage:voyage-finance-2", Provider::Voyage),
            ("ollama:qwen3:8b", Provider::Ollama),
        ] {
            let handle = resolver.resolve(id, ModelSettings::default()).unwrap();
            assert_eq!(handle.id().provider(), provider);
            assert_eq!(handle.backend().provider(), provider);
            assert_eq!(handle.id().to_string(), id);
        }
    }

    #[test]
    fn test_resolve_rejects_malformed_and_unknown() {
        let resolver = ModelResolver::new(all_keys()).unwrap();
        for bad in ["gpt-4o", ":gpt-4o", "openai:", "mistral:large", ""] {
            let err = resolver.resolve(bad, ModelSettings::default()).unwrap_err();
            assert!(matches!(err, Error::Configuration(_)), "{bad}: {err:?}");
        }
    }

    #[test]
    fn test_missing_key_is_configuration_error() {
        let resolver = ModelResolver::new(ProviderSettings::default()).unwrap();
        let err = resolver
            .resolve("anthropic:claude-sonnet-4-0", ModelSettings::default())
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(ref m) if m.contains("ANTHROPIC_API_KEY")));
        // Ollama is keyless.
        assert!(resolver
            .resolve("ollama:llama3.1", ModelSettings::default())
            .is_ok());
    }

    #[test]
    fn test_capability_checks() {
        let resolver = ModelResolver::new(all_keys()).unwrap();
        let err = resolver
            .resolve_generation("voyage:voyage-finance-2", ModelSettings::default())
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = resolver
            .resolve_embedding("anthropic:claude-sonnet-4-0")
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        assert!(resolver.resolve_embedding("openai:text-embedding-3-small").is_ok());
    }

    #[test]
    fn test_settings_applied_to_handle() {
        let resolver = ModelResolver::new(all_keys()).unwrap();
        let settings = ModelSettings {
            temperature: 0.3,
            max_tokens: 512,
        };
        let handle = resolver.resolve("openai:gpt-4o", settings).unwrap();
        assert_eq!(handle.settings(), &settings);
    }

    #[test]
    fn test_settings_from_lookup() {
        let settings = ProviderSettings::from_lookup(|k| match k {
            "OPENAI_API_KEY" => Some("sk-test".into()),
            "OLLAMA_BASE_URL" => Some("http://gpu-box:11434/v1".into()),
            "PROVIDER_TIMEOUT_SECS" => Some("15".into()),
            "GOOGLE_API_KEY" => Some(String::new()),
            _ => None,
        });
        assert_eq!(settings.api_key(Provider::OpenAI), Some("sk-test"));
        assert_eq!(settings.api_key(Provider::Google), None);
        assert_eq!(settings.base_url(Provider::Ollama), "http://gpu-box:11434/v1");
        assert_eq!(settings.base_url(Provider::OpenAI), defaults::OPENAI_BASE_URL);
        assert_eq!(settings.request_timeout, Duration::from_secs(15));
        assert_eq!(
            settings.connect_timeout,
            Duration::from_secs(defaults::PROVIDER_CONNECT_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_worker_count_sizes_pool() {
        let settings = ProviderSettings::default().with_worker_count(8);
        assert_eq!(settings.pool_max_idle_per_host, 16);
    }

    #[test]
    fn test_debug_hides_keys() {
        let rendered = format!("{:?}", all_keys());
        assert!(!rendered.contains("\"a\""));
        assert!(rendered.contains("keys_configured"));
    }

    #[test]
    fn test_chain_for_embedding_agent() {
        let resolver = ModelResolver::new(all_keys()).unwrap();
        let config = ModelConfig {
            agent_type: AgentType::Embedding,
            primary_model_id: ModelId::parse("voyage:voyage-finance-2").unwrap(),
            fallback_model_id: Some(ModelId::parse("openai:text-embedding-3-small").unwrap()),
            temperature: 0.0,
            max_tokens: 1,
        };
        let chain = resolver.chain_for(&config).unwrap();
        assert_eq!(chain.primary().id().provider(), Provider::Voyage);
        assert!(chain.secondary().is_some());

        let bad = ModelConfig {
            agent_type: AgentType::GraphExtraction,
            ..config
        };
        assert!(matches!(
            resolver.chain_for(&bad).unwrap_err(),
            Error::Configuration(_)
        ));
    }
}
