//! Agent model configuration and pricing table.
//!
//! Loaded once at startup from a YAML file:
//!
//! ```yaml
//! version: 1
//! agents:
//!   graph_extraction:
//!     primary: google:gemini-2.0-flash
//!     fallback: anthropic:claude-3-5-haiku-latest
//!     settings: { temperature: 0.0, max_tokens: 8192 }
//!   embedding:
//!     primary: voyage:voyage-finance-2
//!     fallback: ollama:bge-m3
//!   document_analysis:
//!     primary: anthropic:claude-sonnet-4-0
//!   specialist:
//!     primary: anthropic:claude-sonnet-4-0
//!     fallback: openai:gpt-4o
//! pricing:
//!   "google:gemini-2.0-flash": { input_per_million: 0.10, output_per_million: 0.40 }
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `DEALGRAPH_MODELS_FILE` | `config/models.yaml` | Path of the file above |
//! | `DEALGRAPH_<AGENT>_MODEL` | (none) | Overrides an agent's primary model, e.g. `DEALGRAPH_SPECIALIST_MODEL` |

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use dealgraph_core::{
    defaults, AgentType, Error, ModelConfig, ModelId, ModelSettings, PricingTable, Result,
};

const SUPPORTED_VERSION: u32 = 1;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModelsFile {
    version: u32,
    agents: HashMap<AgentType, AgentEntry>,
    #[serde(default)]
    pricing: PricingTable,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AgentEntry {
    primary: String,
    #[serde(default)]
    fallback: Option<String>,
    #[serde(default)]
    settings: ModelSettings,
}

/// Validated per-agent model configuration plus the pricing table.
#[derive(Debug, Clone)]
pub struct AgentModels {
    configs: HashMap<AgentType, ModelConfig>,
    pricing: PricingTable,
}

impl AgentModels {
    /// Load from `DEALGRAPH_MODELS_FILE` and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var(defaults::ENV_MODELS_FILE)
            .unwrap_or_else(|_| defaults::MODELS_FILE.to_string());
        let models = Self::from_file(Path::new(&path))?
            .with_overrides(|key| std::env::var(key).ok())?;
        info!(
            subsystem = "inference",
            component = "config",
            path = %path,
            priced_models = models.pricing.len(),
            "Agent model configuration loaded"
        );
        Ok(models)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let file: ModelsFile = serde_yaml::from_str(raw)
            .map_err(|e| Error::Configuration(format!("Invalid models file: {}", e)))?;

        if file.version != SUPPORTED_VERSION {
            return Err(Error::Configuration(format!(
                "Unsupported models file version {} (expected {})",
                file.version, SUPPORTED_VERSION
            )));
        }

        let missing: Vec<&str> = AgentType::ALL
            .iter()
            .filter(|a| !file.agents.contains_key(a))
            .map(|a| a.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(Error::Configuration(format!(
                "Models file is missing agents: {}",
                missing.join(", ")
            )));
        }

        let pricing = file.pricing.normalized()?;

        let mut configs = HashMap::new();
        for (agent_type, entry) in file.agents {
            let primary_model_id = ModelId::parse(&entry.primary)?;
            let fallback_model_id = entry
                .fallback
                .as_deref()
                .map(ModelId::parse)
                .transpose()?;
            configs.insert(
                agent_type,
                ModelConfig {
                    agent_type,
                    primary_model_id,
                    fallback_model_id,
                    temperature: entry.settings.temperature,
                    max_tokens: entry.settings.max_tokens,
                },
            );
        }

        Ok(Self { configs, pricing })
    }

    /// Replace primary model ids from `DEALGRAPH_<AGENT>_MODEL` style variables.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        for config in self.configs.values_mut() {
            let key = config.agent_type.env_override_key();
            if let Some(value) = lookup(&key).filter(|v| !v.trim().is_empty()) {
                let id = ModelId::parse(&value)?;
                debug!(
                    subsystem = "inference",
                    component = "config",
                    agent = %config.agent_type,
                    model = %id,
                    "Primary model overridden from environment"
                );
                config.primary_model_id = id;
            }
        }
        Ok(self)
    }

    pub fn get(&self, agent_type: AgentType) -> Result<&ModelConfig> {
        self.configs.get(&agent_type).ok_or_else(|| {
            Error::Configuration(format!("No model configured for agent {}", agent_type))
        })
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealgraph_core::Provider;

    const SAMPLE: &str = r#"
version: 1
agents:
  graph_extraction:
    primary: google:gemini-2.0-flash
    fallback: anthropic:claude-3-5-haiku-latest
    settings:
      temperature: 0.0
      max_tokens: 8192
  embedding:
    primary: voyage:voyage-finance-2
    fallback: ollama:bge-m3
  document_analysis:
    primary: anthropic:claude-sonnet-4-0
  specialist:
    primary: anthropic:claude-sonnet-4-0
    fallback: openai:gpt-4o
    settings:
      temperature: 0.2
pricing:
  "google:gemini-2.0-flash": { input_per_million: 0.10, output_per_million: 0.40 }
  "voyage:voyage-finance-2": { input_per_million: 0.12, output_per_million: 0.0 }
"#;

    #[test]
    fn test_parse_sample() {
        let models = AgentModels::from_yaml_str(SAMPLE).unwrap();
        let extraction = models.get(AgentType::GraphExtraction).unwrap();
        assert_eq!(extraction.primary_model_id.provider(), Provider::Google);
        assert_eq!(
            extraction.fallback_model_id.as_ref().unwrap().to_string(),
            "anthropic:claude-3-5-haiku-latest"
        );
        assert_eq!(extraction.max_tokens, 8192);

        let analysis = models.get(AgentType::DocumentAnalysis).unwrap();
        assert!(analysis.fallback_model_id.is_none());
        assert_eq!(analysis.max_tokens, defaults::MODEL_MAX_TOKENS);

        let specialist = models.get(AgentType::Specialist).unwrap();
        assert_eq!(specialist.temperature, 0.2);
        assert_eq!(specialist.max_tokens, defaults::MODEL_MAX_TOKENS);

        assert_eq!(models.pricing().len(), 2);
    }

    #[test]
    fn test_env_override_replaces_primary() {
        let models = AgentModels::from_yaml_str(SAMPLE)
            .unwrap()
            .with_overrides(|k| {
                (k == "DEALGRAPH_SPECIALIST_MODEL").then(|| "openai:gpt-4.1".to_string())
            })
            .unwrap();
        let specialist = models.get(AgentType::Specialist).unwrap();
        assert_eq!(specialist.primary_model_id.to_string(), "openai:gpt-4.1");
        // Fallback is untouched.
        assert_eq!(
            specialist.fallback_model_id.as_ref().unwrap().to_string(),
            "openai:gpt-4o"
        );
    }

    #[test]
    fn test_bad_override_is_configuration_error() {
        let err = AgentModels::from_yaml_str(SAMPLE)
            .unwrap()
            .with_overrides(|k| (k == "DEALGRAPH_EMBEDDING_MODEL").then(|| "nope".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_missing_agent_rejected() {
        let raw = "version: 1\nagents:\n  embedding:\n    primary: voyage:voyage-3\n";
        let err = AgentModels::from_yaml_str(raw).unwrap_err();
        assert!(err.to_string().contains("graph_extraction"));
    }

    #[test]
    fn test_malformed_model_id_rejected() {
        let raw = SAMPLE.replace("google:gemini-2.0-flash\n    fallback", "gemini\n    fallback");
        let err = AgentModels::from_yaml_str(&raw).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let raw = SAMPLE.replace("version: 1", "version: 2");
        assert!(AgentModels::from_yaml_str(&raw).is_err());
    }

    #[test]
    fn test_invalid_pricing_key_rejected() {
        let raw = format!(
            "{}  \"bogus\": {{ input_per_million: 1.0, output_per_million: 1.0 }}\n",
            SAMPLE
        );
        let err = AgentModels::from_yaml_str(&raw).unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn test_pricing_keys_are_normalized() {
        let raw = SAMPLE.replace("\"google:gemini-2.0-flash\"", "\" google : gemini-2.0-flash \"");
        let models = AgentModels::from_yaml_str(&raw).unwrap();
        let flash = ModelId::new(Provider::Google, "gemini-2.0-flash");
        let pricing = models.pricing().get(&flash).unwrap();
        assert_eq!(pricing.input_per_million, 0.10);
    }

    #[test]
    fn test_duplicate_pricing_key_rejected() {
        let raw = format!(
            "{}  \"voyage: voyage-finance-2\": {{ input_per_million: 9.0, output_per_million: 0.0 }}\n",
            SAMPLE
        );
        let err = AgentModels::from_yaml_str(&raw).unwrap_err();
        assert!(err.to_string().contains("Duplicate pricing entry for voyage:voyage-finance-2"));
    }

    #[test]
    fn test_shipped_models_file_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/models.yaml");
        let models = AgentModels::from_file(&path).unwrap();
        for agent in AgentType::ALL {
            assert!(models.get(agent).is_ok());
        }
    }
}
