//! Error types for dealgraph.
//!
//! The taxonomy drives two independent decisions:
//!
//! | Question | Helper | Consumer |
//! |----------|--------|----------|
//! | Should the call hop to the secondary model? | [`Error::is_provider_transient`] | Fallback Chain |
//! | Should the queue redeliver the stage job? | [`Error::is_retryable`] | Stage/Retry Manager |

use thiserror::Error;

/// Result type alias using dealgraph's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for dealgraph operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Document not found
    #[error("Document not found: {0}")]
    DocumentNotFound(uuid::Uuid),

    /// Bad model string, unknown provider, missing credentials
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Provider outage signal: 5xx, rate limit, timeout, connection failure
    #[error("Provider unavailable: {0}")]
    ProviderTransient(String),

    /// Provider rejected the request itself (malformed request, auth failure)
    #[error("Provider error: {0}")]
    Provider(String),

    /// Graph store could not be reached or rejected the write
    #[error("Graph connection error: {0}")]
    GraphConnection(String),

    /// Model output could not be parsed into entities/relationships
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// Embedding output was unusable (wrong count, empty vector)
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Job queue error
    #[error("Job error: {0}")]
    Job(String),

    /// Operation exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Authentication failed
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated but not allowed to touch the tenant
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build the error for a non-success provider HTTP status.
    ///
    /// 400/401/403/422 are faults in the request itself and never improve by
    /// switching provider; every other 4xx/5xx is treated as an outage signal.
    pub fn from_provider_status(provider: &str, status: u16, message: &str) -> Self {
        if is_transient_status(status) {
            Error::ProviderTransient(format!("{} returned HTTP {}: {}", provider, status, message))
        } else {
            Error::Provider(format!("{} returned HTTP {}: {}", provider, status, message))
        }
    }

    /// Whether this error should trigger a single-hop provider fallback.
    pub fn is_provider_transient(&self) -> bool {
        matches!(self, Error::ProviderTransient(_) | Error::Timeout(_))
    }

    /// Whether the job that raised this error should be redelivered by the queue.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ProviderTransient(_)
            | Error::Timeout(_)
            | Error::GraphConnection(_)
            | Error::Extraction(_) => true,
            Error::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            _ => false,
        }
    }
}

/// Whether an HTTP status from a provider counts as transient.
pub fn is_transient_status(status: u16) -> bool {
    match status {
        400 | 401 | 403 | 422 => false,
        400..=599 => true,
        _ => false,
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Error::Timeout(e.to_string());
        }
        if e.is_connect() {
            return Error::ProviderTransient(e.to_string());
        }
        match e.status() {
            Some(status) => Error::from_provider_status("provider", status.as_u16(), &e.to_string()),
            None if e.is_decode() => Error::Provider(format!("Undecodable response: {}", e)),
            None => Error::ProviderTransient(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_error_display_configuration() {
        let err = Error::Configuration("missing provider".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing provider");
    }

    #[test]
    fn test_error_display_document_not_found() {
        let id = Uuid::nil();
        let err = Error::DocumentNotFound(id);
        assert_eq!(err.to_string(), format!("Document not found: {}", id));
    }

    #[test]
    fn test_status_classification() {
        assert!(!is_transient_status(400));
        assert!(!is_transient_status(401));
        assert!(!is_transient_status(403));
        assert!(!is_transient_status(422));
        assert!(is_transient_status(404));
        assert!(is_transient_status(408));
        assert!(is_transient_status(429));
        assert!(is_transient_status(500));
        assert!(is_transient_status(503));
        assert!(!is_transient_status(200));
        assert!(!is_transient_status(302));
    }

    #[test]
    fn test_from_provider_status_rate_limit_is_transient() {
        let err = Error::from_provider_status("anthropic", 429, "slow down");
        assert!(err.is_provider_transient());
        assert!(err.is_retryable());
        assert!(err.to_string().contains("HTTP 429"));
    }

    #[test]
    fn test_from_provider_status_auth_is_permanent() {
        let err = Error::from_provider_status("openai", 401, "bad key");
        assert!(matches!(err, Error::Provider(_)));
        assert!(!err.is_provider_transient());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_configuration_is_never_retried() {
        let err = Error::Configuration("bad".into());
        assert!(!err.is_retryable());
        assert!(!err.is_provider_transient());
    }

    #[test]
    fn test_graph_connection_retryable_but_no_fallback() {
        let err = Error::GraphConnection("refused".into());
        assert!(err.is_retryable());
        assert!(!err.is_provider_transient());
    }

    #[test]
    fn test_extraction_retryable_but_no_fallback() {
        let err = Error::Extraction("no JSON object".into());
        assert!(err.is_retryable());
        assert!(!err.is_provider_transient());
    }

    #[test]
    fn test_database_pool_timeout_retryable() {
        assert!(Error::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!Error::Database(sqlx::Error::RowNotFound).is_retryable());
    }

    #[test]
    fn test_invalid_input_not_retryable() {
        assert!(!Error::InvalidInput("no chunks".into()).is_retryable());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
