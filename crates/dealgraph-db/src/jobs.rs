//! Stage job queue backed by `job_queue`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::{Pool, Postgres, Row};
use tokio::sync::Notify;
use uuid::Uuid;

use dealgraph_core::{
    defaults, new_v7, Error, Job, JobRepository, JobStatus, PipelineStage, Result,
};

const JOB_COLUMNS: &str = "id, document_id, stage, status, payload, retry_count, max_retries,
     error_message, run_after, created_at, started_at, completed_at";

/// PostgreSQL implementation of [`JobRepository`].
pub struct PgJobRepository {
    pool: Pool<Postgres>,
    notify: Arc<Notify>,
    max_retries: i32,
}

impl PgJobRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            notify: Arc::new(Notify::new()),
            max_retries: defaults::JOB_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Signalled whenever a job is enqueued; idle workers wait on it between polls.
    pub fn job_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    fn parse_job_row(row: sqlx::postgres::PgRow) -> Result<Job> {
        let stage: String = row.try_get("stage")?;
        let status: String = row.try_get("status")?;
        Ok(Job {
            id: row.try_get("id")?,
            document_id: row.try_get("document_id")?,
            stage: stage.parse()?,
            status: status.parse::<JobStatus>()?,
            payload: row.try_get("payload")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            error_message: row.try_get("error_message")?,
            run_after: row.try_get("run_after")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn enqueue(
        &self,
        stage: PipelineStage,
        document_id: Option<Uuid>,
        payload: JsonValue,
    ) -> Result<Uuid> {
        let job_id = new_v7();
        let now = Utc::now();

        // Atomic check-and-insert; the partial unique index backs it up under races.
        let inserted = sqlx::query_scalar::<_, Uuid>(
            "INSERT INTO job_queue (id, document_id, stage, status, payload, max_retries, run_after, created_at)
             SELECT $1, $2, $3, 'pending', $4, $5, $6, $6
             WHERE $2::uuid IS NULL OR NOT EXISTS (
                 SELECT 1 FROM job_queue
                 WHERE document_id = $2 AND stage = $3 AND status IN ('pending', 'running')
             )
             ON CONFLICT DO NOTHING
             RETURNING id",
        )
        .bind(job_id)
        .bind(document_id)
        .bind(stage.as_str())
        .bind(&payload)
        .bind(self.max_retries)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        if let Some(id) = inserted {
            self.notify.notify_one();
            return Ok(id);
        }

        let existing: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM job_queue
             WHERE document_id = $1 AND stage = $2 AND status IN ('pending', 'running')
             ORDER BY created_at ASC LIMIT 1",
        )
        .bind(document_id)
        .bind(stage.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        existing.ok_or_else(|| {
            Error::Job(format!(
                "enqueue of {} for {:?} neither inserted nor found a live job",
                stage, document_id
            ))
        })
    }

    async fn claim_next(&self, stages: &[PipelineStage]) -> Result<Option<Job>> {
        let now = Utc::now();
        let stage_strings: Vec<String> = stages.iter().map(|s| s.as_str().to_string()).collect();

        let query = format!(
            "UPDATE job_queue
             SET status = 'running', started_at = $1
             WHERE id = (
                 SELECT id FROM job_queue
                 WHERE status = 'pending'
                   AND run_after <= $1
                   AND (cardinality($2::text[]) = 0 OR stage = ANY($2))
                 ORDER BY run_after ASC, created_at ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}"
        );

        let row = sqlx::query(&query)
            .bind(now)
            .bind(&stage_strings)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn complete(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE job_queue
             SET status = 'completed', completed_at = $1, error_message = NULL
             WHERE id = $2",
        )
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn retry_later(&self, job_id: Uuid, error: &str, delay: Duration) -> Result<()> {
        let run_after = Utc::now()
            + chrono::Duration::from_std(delay)
                .map_err(|e| Error::InvalidInput(format!("retry delay out of range: {}", e)))?;
        sqlx::query(
            "UPDATE job_queue
             SET status = 'pending', retry_count = retry_count + 1, error_message = $1,
                 run_after = $2, started_at = NULL
             WHERE id = $3",
        )
        .bind(error)
        .bind(run_after)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE job_queue
             SET status = 'failed', completed_at = $1, error_message = $2
             WHERE id = $3",
        )
        .bind(Utc::now())
        .bind(error)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM job_queue WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.map(Self::parse_job_row).transpose()
    }

    async fn pending_count(&self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM job_queue WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(count)
    }
}
