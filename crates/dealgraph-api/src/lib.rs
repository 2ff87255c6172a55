//! # dealgraph-api
//!
//! HTTP surface for dealgraph: specialist queries over a deal's knowledge
//! graph and per-document pipeline stage control.
//!
//! | Method | Path | Handler |
//! |--------|------|---------|
//! | GET | `/health` | [`handlers::health_check`] |
//! | POST | `/api/v1/specialist/query` | [`handlers::query_specialist`] |
//! | GET | `/api/v1/documents/:id/stage` | [`handlers::get_stage`] |
//! | POST | `/api/v1/documents/:id/retry` | [`handlers::retry_document`] |
//!
//! Every `/api` route requires `Authorization: Bearer <key>` and
//! `X-Organization-Id` (see [`auth::Tenant`]).

pub mod auth;
pub mod error;
pub mod handlers;
pub mod state;

use std::time::Duration;

use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use dealgraph_core::defaults;

pub use auth::Tenant;
pub use error::ApiError;
pub use state::{ApiKeys, AppState};

#[derive(Clone, Default)]
struct MakeRequestUuidV7;

impl MakeRequestId for MakeRequestUuidV7 {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = Uuid::now_v7().to_string().parse().ok()?;
        Some(RequestId::new(id))
    }
}

/// Parse `ALLOWED_ORIGINS` (comma-separated). Invalid entries are skipped.
pub fn parse_allowed_origins(raw: &str) -> Vec<HeaderValue> {
    raw.split(',')
        .filter_map(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.parse::<HeaderValue>() {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!("Invalid CORS origin '{}': {}", trimmed, e);
                    None
                }
            }
        })
        .collect()
}

/// CORS restricted to `origins`; no origins means no cross-origin access.
pub fn cors_layer(origins: Vec<HeaderValue>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static(auth::ORGANIZATION_HEADER),
        ])
        .max_age(Duration::from_secs(3600))
}

/// Build the application router with request tracing, request ids,
/// panic recovery and a body size limit.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/v1/specialist/query", post(handlers::query_specialist))
        .route("/api/v1/documents/:id/stage", get(handlers::get_stage))
        .route("/api/v1/documents/:id/retry", post(handlers::retry_document))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuidV7))
        .layer(CatchPanicLayer::new())
        .layer(RequestBodyLimitLayer::new(defaults::MAX_BODY_BYTES))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_allowed_origins_skips_blanks() {
        let origins = parse_allowed_origins("https://a.example, ,http://localhost:3000,");
        assert_eq!(origins.len(), 2);
        assert_eq!(origins[0], "https://a.example");
        assert!(parse_allowed_origins("").is_empty());
    }
}
