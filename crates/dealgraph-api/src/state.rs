//! Shared application state.

use std::collections::HashSet;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use dealgraph_core::{DocumentRepository, GraphStore};
use dealgraph_inference::{EmbeddingAdapter, FallbackChain, UsageLogger};
use dealgraph_jobs::StageManager;

/// Environment variable holding comma-separated API keys.
pub const ENV_API_KEYS: &str = "DEALGRAPH_API_KEYS";

/// Accepted API keys, held only as SHA-256 hex digests.
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    digests: HashSet<String>,
}

impl ApiKeys {
    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let digests = keys
            .into_iter()
            .map(|k| k.as_ref().trim().to_string())
            .filter(|k| !k.is_empty())
            .map(|k| digest(&k))
            .collect();
        Self { digests }
    }

    pub fn from_env() -> Self {
        let raw = std::env::var(ENV_API_KEYS).unwrap_or_default();
        Self::from_keys(raw.split(','))
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn verify(&self, token: &str) -> bool {
        !token.is_empty() && self.digests.contains(&digest(token))
    }
}

fn digest(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Everything a request handler needs, cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub documents: Arc<dyn DocumentRepository>,
    pub graph: Arc<dyn GraphStore>,
    pub stages: Arc<StageManager>,
    /// Query embeddings; must match the vectors stored by graph ingestion.
    pub embeddings: Arc<EmbeddingAdapter>,
    /// `specialist` agent chain.
    pub specialist: Arc<FallbackChain>,
    pub usage: Arc<UsageLogger>,
    pub api_keys: Arc<ApiKeys>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_keys_verify_against_digests() {
        let keys = ApiKeys::from_keys(["alpha", " beta ", ""]);
        assert_eq!(keys.len(), 2);
        assert!(keys.verify("alpha"));
        assert!(keys.verify("beta"));
        assert!(!keys.verify("gamma"));
        assert!(!keys.verify(""));
    }

    #[test]
    fn test_empty_key_set_rejects_everything() {
        let keys = ApiKeys::from_keys(Vec::<String>::new());
        assert!(keys.is_empty());
        assert!(!keys.verify("anything"));
    }
}
