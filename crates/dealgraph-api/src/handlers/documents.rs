//! Document stage inspection and operator retry.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use dealgraph_core::{Document, PipelineStage, StageState, StageStatus};

use crate::auth::Tenant;
use crate::error::ApiError;
use crate::state::AppState;

/// Load a document and check it belongs to the caller's organization.
async fn load_owned(state: &AppState, tenant: &Tenant, id: Uuid) -> Result<Document, ApiError> {
    let document = state.documents.get_document(id).await?;
    tenant.authorize(&document.organization_id)?;
    Ok(document)
}

/// `GET /api/v1/documents/:id/stage`
pub async fn get_stage(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(id): Path<Uuid>,
) -> Result<Json<StageState>, ApiError> {
    load_owned(&state, &tenant, id).await?;
    let stage = state
        .stages
        .state(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Document {} has not entered the pipeline", id)))?;
    Ok(Json(stage))
}

/// Body of `POST /api/v1/documents/:id/retry`. May be empty.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryRequest {
    /// Stage to resume from; defaults to the document's current stage.
    #[serde(default)]
    pub stage: Option<PipelineStage>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAccepted {
    pub document_id: Uuid,
    pub stage: PipelineStage,
    pub job_id: Option<Uuid>,
}

/// `POST /api/v1/documents/:id/retry`
///
/// Resets the document to the requested stage and queues it. Without a
/// stage, a finished pipeline is a conflict; a stage that is mid-run is
/// always a conflict.
#[instrument(skip_all, fields(subsystem = "api", component = "documents", document_id = %id))]
pub async fn retry_document(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Result<(StatusCode, Json<RetryAccepted>), ApiError> {
    let request: RetryRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RetryRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid retry body: {}", e)))?
    };

    let document = load_owned(&state, &tenant, id).await?;
    let current = state
        .stages
        .state(id)
        .await?
        .unwrap_or_else(|| StageState::new(id));

    if current.status == StageStatus::Processing {
        return Err(ApiError::Conflict(format!(
            "Stage {} is running for document {}",
            current.current_stage, id
        )));
    }
    let stage = match request.stage {
        Some(stage) => stage,
        None if current.is_finished() => {
            return Err(ApiError::Conflict(format!(
                "Document {} has finished the pipeline; name a stage to re-run",
                id
            )))
        }
        None => current.current_stage,
    };

    state.stages.reset_to(id, stage).await?;
    let job_id = state.stages.ensure_enqueued(&document).await?;

    info!(
        stage = %stage,
        job_id = ?job_id,
        organization_id = %tenant.organization_id,
        "Document retry queued"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(RetryAccepted {
            document_id: id,
            stage,
            job_id,
        }),
    ))
}
