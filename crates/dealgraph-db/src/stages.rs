//! Per-document pipeline stage state.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use dealgraph_core::{Error, PipelineStage, Result, StageRepository, StageState, StageStatus};

pub struct PgStageRepository {
    pool: Pool<Postgres>,
}

impl PgStageRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StageRepository for PgStageRepository {
    async fn get(&self, document_id: Uuid) -> Result<Option<StageState>> {
        let row = sqlx::query(
            "SELECT document_id, current_stage, status, retryable, retry_count, last_error, updated_at
             FROM document_stage WHERE document_id = $1",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let stage: String = row.try_get("current_stage")?;
        let status: String = row.try_get("status")?;
        let retryable: bool = row.try_get("retryable")?;
        Ok(Some(StageState {
            document_id: row.try_get("document_id")?,
            current_stage: stage.parse::<PipelineStage>()?,
            status: StageStatus::from_parts(&status, retryable)?,
            retry_count: row.try_get("retry_count")?,
            last_error: row.try_get("last_error")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn upsert(&self, state: &StageState) -> Result<()> {
        sqlx::query(
            "INSERT INTO document_stage
                 (document_id, current_stage, status, retryable, retry_count, last_error, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (document_id) DO UPDATE SET
                 current_stage = EXCLUDED.current_stage,
                 status = EXCLUDED.status,
                 retryable = EXCLUDED.retryable,
                 retry_count = EXCLUDED.retry_count,
                 last_error = EXCLUDED.last_error,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(state.document_id)
        .bind(state.current_stage.as_str())
        .bind(state.status.as_str())
        .bind(state.status.is_retryable_failure())
        .bind(state.retry_count)
        .bind(&state.last_error)
        .bind(state.updated_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }
}
