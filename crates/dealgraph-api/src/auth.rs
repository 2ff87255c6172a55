//! Request authentication and tenant scoping.

use axum::extract::FromRequestParts;
use axum::http::header;
use axum::http::request::Parts;
use tracing::debug;

use crate::error::ApiError;
use crate::state::AppState;

/// Header naming the organization a request acts for.
pub const ORGANIZATION_HEADER: &str = "x-organization-id";

/// Extractor for authenticated, tenant-scoped requests.
///
/// Requires `Authorization: Bearer <key>` with a configured API key and a
/// non-empty `X-Organization-Id` header.
///
/// ```ignore
/// async fn my_handler(tenant: Tenant, Json(body): Json<Body>) -> Result<_, ApiError> {
///     tenant.authorize(&body.organization_id)?;
///     // ...
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub organization_id: String,
}

impl Tenant {
    /// Reject access to data owned by another organization.
    pub fn authorize(&self, organization_id: &str) -> Result<(), ApiError> {
        if self.organization_id == organization_id {
            Ok(())
        } else {
            debug!(
                subsystem = "api",
                component = "auth",
                tenant = %self.organization_id,
                requested = %organization_id,
                "Cross-tenant access rejected"
            );
            Err(ApiError::Forbidden(
                "Organization does not match X-Organization-Id".to_string(),
            ))
        }
    }
}

#[axum::async_trait]
impl FromRequestParts<AppState> for Tenant {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".to_string()))?;

        if !state.api_keys.verify(token) {
            return Err(ApiError::Unauthorized("Invalid API key".to_string()));
        }

        let organization_id = parts
            .headers
            .get(ORGANIZATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::BadRequest("Missing X-Organization-Id header".to_string()))?;

        Ok(Tenant {
            organization_id: organization_id.to_string(),
        })
    }
}
