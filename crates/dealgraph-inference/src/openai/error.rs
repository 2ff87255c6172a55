//! Provider error body handling.

use dealgraph_core::{Error, Provider};

use super::types::OpenAIErrorResponse;

/// Error codes recognised in OpenAI-style error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenAIErrorCode {
    AuthenticationError,
    PermissionDenied,
    RateLimitExceeded,
    ModelNotFound,
    ContextLengthExceeded,
    InvalidRequest,
    ServerError,
    Unknown,
}

impl OpenAIErrorCode {
    /// Determine error code from HTTP status and error type.
    pub fn from_response(status: u16, error_type: &str) -> Self {
        match (status, error_type) {
            (401, _) => Self::AuthenticationError,
            (403, _) => Self::PermissionDenied,
            (429, _) => Self::RateLimitExceeded,
            (404, _) | (_, "model_not_found") => Self::ModelNotFound,
            (400, _) if error_type.contains("context_length") => Self::ContextLengthExceeded,
            (400, _) | (422, _) => Self::InvalidRequest,
            (500..=599, _) => Self::ServerError,
            _ => Self::Unknown,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::AuthenticationError => "authentication failed",
            Self::PermissionDenied => "permission denied",
            Self::RateLimitExceeded => "rate limit exceeded",
            Self::ModelNotFound => "model not found",
            Self::ContextLengthExceeded => "context too long",
            Self::InvalidRequest => "invalid request",
            Self::ServerError => "server error",
            Self::Unknown => "unexpected status",
        }
    }
}

/// Build the dealgraph error for a non-success response.
///
/// Transient vs. permanent is decided by the status alone so every provider
/// classifies identically.
pub fn to_dealgraph_error(provider: Provider, status: u16, body: &str) -> Error {
    let (error_type, message) = match serde_json::from_str::<OpenAIErrorResponse>(body) {
        Ok(parsed) => (parsed.error.error_type.unwrap_or_default(), parsed.error.message),
        Err(_) => (String::new(), truncate(body, 300)),
    };
    let code = OpenAIErrorCode::from_response(status, &error_type);
    Error::from_provider_status(
        provider.as_str(),
        status,
        &format!("{}: {}", code.label(), message),
    )
}

pub(crate) fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max_chars).collect();
        out.push('…');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_from_401() {
        let code = OpenAIErrorCode::from_response(401, "invalid_api_key");
        assert_eq!(code, OpenAIErrorCode::AuthenticationError);
    }

    #[test]
    fn test_error_code_from_429() {
        let code = OpenAIErrorCode::from_response(429, "rate_limit_exceeded");
        assert_eq!(code, OpenAIErrorCode::RateLimitExceeded);
    }

    #[test]
    fn test_error_code_context_length() {
        let code = OpenAIErrorCode::from_response(400, "context_length_exceeded");
        assert_eq!(code, OpenAIErrorCode::ContextLengthExceeded);
    }

    #[test]
    fn test_error_code_from_502() {
        let code = OpenAIErrorCode::from_response(502, "bad_gateway");
        assert_eq!(code, OpenAIErrorCode::ServerError);
    }

    #[test]
    fn test_rate_limit_body_is_transient() {
        let body = r#"{"error": {"message": "Too many requests", "type": "rate_limit_exceeded"}}"#;
        let err = to_dealgraph_error(Provider::OpenAI, 429, body);
        assert!(err.is_provider_transient());
        assert!(err.to_string().contains("rate limit exceeded"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn test_auth_body_is_permanent() {
        let body = r#"{"error": {"message": "Invalid key", "type": "invalid_request_error"}}"#;
        let err = to_dealgraph_error(Provider::Google, 401, body);
        assert!(matches!(err, Error::Provider(_)));
        assert!(err.to_string().contains("google"));
    }

    #[test]
    fn test_non_json_body_is_kept_as_message() {
        let err = to_dealgraph_error(Provider::Ollama, 503, "upstream connect error");
        assert!(err.is_provider_transient());
        assert!(err.to_string().contains("upstream connect error"));
    }

    #[test]
    fn test_truncate_long_body() {
        let long = "x".repeat(1000);
        assert_eq!(truncate(&long, 10).chars().count(), 11);
        assert_eq!(truncate("short", 10), "short");
    }
}
