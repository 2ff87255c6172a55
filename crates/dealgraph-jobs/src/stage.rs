//! Stage/retry manager: the only writer of `StageState`.
//!
//! Transitions:
//!
//! ```text
//! queued ─begin─▶ processing(stage) ─complete─▶ completed(stage) ─advance─▶ next stage queued
//!                        │
//!                        └─fail─▶ failed(stage, retryable) ─(backoff)─▶ processing(stage)
//! ```
//!
//! Retries are detected from `StageState.retry_count`, not from queue
//! metadata, so a redelivered job sees exactly the state its last attempt
//! left behind.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use dealgraph_core::{
    defaults, Document, DocumentRepository, DocumentStatus, Error, Job, JobRepository,
    PipelineStage, Result, StagePayload, StageRepository, StageState, StageStatus,
};
use dealgraph_db::Database;

/// Exponential backoff between stage retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(defaults::RETRY_BASE_DELAY_SECS),
            max_delay: Duration::from_secs(defaults::RETRY_MAX_DELAY_SECS),
        }
    }
}

impl RetryPolicy {
    /// Create policy from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `RETRY_BASE_DELAY_SECS` | `30` | Delay before the first retry |
    /// | `RETRY_MAX_DELAY_SECS` | `900` | Cap on any single delay |
    pub fn from_env() -> Self {
        let secs = |key: &str, default: u64| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(default)
        };
        Self {
            base_delay: Duration::from_secs(secs(
                "RETRY_BASE_DELAY_SECS",
                defaults::RETRY_BASE_DELAY_SECS,
            )),
            max_delay: Duration::from_secs(secs(
                "RETRY_MAX_DELAY_SECS",
                defaults::RETRY_MAX_DELAY_SECS,
            )),
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// `base × 2^retry_count`, capped at `max_delay`.
    pub fn delay_for(&self, retry_count: i32) -> Duration {
        let exponent = retry_count.clamp(0, 31) as u32;
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// What the worker should do with a freshly claimed job.
#[derive(Debug)]
pub enum BeginOutcome {
    /// Run the handler.
    Proceed(StageRun),
    /// The document is already past this stage; ack the job and advance.
    AlreadyCompleted(StageState),
}

/// A stage that has been marked processing.
#[derive(Debug, Clone)]
pub struct StageRun {
    pub state: StageState,
    pub document: Document,
    pub is_retry: bool,
}

/// Result of recording a handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Job handed back to the queue.
    Retrying { retry_count: i32, delay: Duration },
    /// Stage failed for good; `exhausted` is true when a retryable error ran out of attempts.
    Failed { exhausted: bool },
}

pub struct StageManager {
    jobs: Arc<dyn JobRepository>,
    stages: Arc<dyn StageRepository>,
    documents: Arc<dyn DocumentRepository>,
    policy: RetryPolicy,
}

impl StageManager {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        stages: Arc<dyn StageRepository>,
        documents: Arc<dyn DocumentRepository>,
    ) -> Self {
        Self {
            jobs,
            stages,
            documents,
            policy: RetryPolicy::default(),
        }
    }

    /// Manager over the PostgreSQL repositories.
    pub fn for_database(db: &Database) -> Self {
        Self::new(db.jobs.clone(), db.stages.clone(), db.documents.clone())
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn state(&self, document_id: Uuid) -> Result<Option<StageState>> {
        self.stages.get(document_id).await
    }

    /// Make sure a document that is not yet ready has a live job.
    ///
    /// Returns the job id, or `None` when the pipeline is finished or the
    /// document is parked in a permanent failure.
    pub async fn ensure_enqueued(&self, document: &Document) -> Result<Option<Uuid>> {
        let payload = StagePayload::new(document.id, &document.namespace()?);
        let state = match self.stages.get(document.id).await? {
            Some(state) => state,
            None => {
                let state = StageState::new(document.id);
                self.stages.upsert(&state).await?;
                state
            }
        };

        if state.is_finished() || state.status == (StageStatus::Failed { retryable: false }) {
            return Ok(None);
        }
        if state.status == StageStatus::Completed {
            return self.advance(&payload, state.current_stage).await;
        }
        let job_id = self
            .jobs
            .enqueue(state.current_stage, Some(document.id), payload.to_json())
            .await?;
        debug!(
            subsystem = "jobs",
            component = "stage_manager",
            op = "ensure_enqueued",
            document_id = %document.id,
            stage = %state.current_stage,
            job_id = %job_id,
            "Stage job queued"
        );
        Ok(Some(job_id))
    }

    /// Enter `job.stage` for the payload's document.
    pub async fn begin(&self, job: &Job, payload: &StagePayload) -> Result<BeginOutcome> {
        let stage = job.stage;
        let document = self.documents.get_document(payload.document_id).await?;
        if document.organization_id != payload.organization_id || document.deal_id != payload.deal_id
        {
            return Err(Error::InvalidInput(format!(
                "job {} namespace does not match document {}",
                job.id, document.id
            )));
        }

        let mut state = self
            .stages
            .get(document.id)
            .await?
            .unwrap_or_else(|| StageState::new(document.id));

        if state.has_completed(stage) {
            debug!(
                subsystem = "jobs",
                component = "stage_manager",
                op = "begin",
                document_id = %document.id,
                stage = %stage,
                "Stage already completed"
            );
            return Ok(BeginOutcome::AlreadyCompleted(state));
        }
        if let Some(previous) = stage.previous() {
            if !state.has_completed(previous) {
                return Err(Error::InvalidInput(format!(
                    "document {} cannot enter {} before completing {} (at {} {})",
                    document.id,
                    stage,
                    previous,
                    state.current_stage,
                    state.status.as_str()
                )));
            }
        }

        let is_retry = state.retry_count > 0 || state.status.is_retryable_failure();
        state.current_stage = stage;
        state.status = StageStatus::Processing;
        state.updated_at = Utc::now();
        self.stages.upsert(&state).await?;

        let target = DocumentStatus::for_stage(stage);
        if document.status != target {
            self.documents.update_status(document.id, target).await?;
        }

        info!(
            subsystem = "jobs",
            component = "stage_manager",
            op = "begin",
            document_id = %document.id,
            stage = %stage,
            retry_count = state.retry_count,
            is_retry,
            "Stage processing"
        );
        Ok(BeginOutcome::Proceed(StageRun {
            state,
            document,
            is_retry,
        }))
    }

    /// Mark `stage` completed and clear any stored error.
    pub async fn complete(&self, document_id: Uuid, stage: PipelineStage) -> Result<StageState> {
        let mut state = self
            .stages
            .get(document_id)
            .await?
            .unwrap_or_else(|| StageState::new(document_id));
        state.current_stage = stage;
        state.status = StageStatus::Completed;
        state.retry_count = 0;
        state.last_error = None;
        state.updated_at = Utc::now();
        self.stages.upsert(&state).await?;
        self.documents.clear_error(document_id).await?;

        info!(
            subsystem = "jobs",
            component = "stage_manager",
            op = "complete",
            document_id = %document_id,
            stage = %stage,
            "Stage completed"
        );
        Ok(state)
    }

    /// Queue the stage after `stage`, or mark the document ready after the last one.
    pub async fn advance(
        &self,
        payload: &StagePayload,
        stage: PipelineStage,
    ) -> Result<Option<Uuid>> {
        match stage.next() {
            Some(next) => {
                let job_id = self
                    .jobs
                    .enqueue(next, Some(payload.document_id), payload.to_json())
                    .await?;
                debug!(
                    subsystem = "jobs",
                    component = "stage_manager",
                    op = "advance",
                    document_id = %payload.document_id,
                    stage = %next,
                    job_id = %job_id,
                    "Next stage queued"
                );
                Ok(Some(job_id))
            }
            None => {
                self.documents
                    .update_status(payload.document_id, DocumentStatus::Ready)
                    .await?;
                info!(
                    subsystem = "jobs",
                    component = "stage_manager",
                    op = "advance",
                    document_id = %payload.document_id,
                    "Document ready"
                );
                Ok(None)
            }
        }
    }

    /// Record a handler failure for `job`.
    ///
    /// Retryable failures go back to the queue until the job's
    /// `max_retries` is spent; anything else parks the document in `error`.
    pub async fn fail(&self, job: &Job, message: &str, retryable: bool) -> Result<FailOutcome> {
        let document_id = job
            .document_id
            .ok_or_else(|| Error::Job(format!("job {} has no document", job.id)))?;
        let stage = job.stage;
        let mut state = self
            .stages
            .get(document_id)
            .await?
            .unwrap_or_else(|| StageState::new(document_id));
        state.current_stage = stage;
        state.last_error = Some(message.to_string());
        state.updated_at = Utc::now();

        if retryable && state.retry_count < job.max_retries {
            let delay = self.policy.delay_for(state.retry_count);
            state.retry_count += 1;
            state.status = StageStatus::Failed { retryable: true };
            self.stages.upsert(&state).await?;
            self.jobs.retry_later(job.id, message, delay).await?;

            warn!(
                subsystem = "jobs",
                component = "stage_manager",
                op = "fail",
                document_id = %document_id,
                job_id = %job.id,
                stage = %stage,
                retry_count = state.retry_count,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "Stage failed, retry scheduled"
            );
            return Ok(FailOutcome::Retrying {
                retry_count: state.retry_count,
                delay,
            });
        }

        state.status = StageStatus::Failed { retryable: false };
        self.stages.upsert(&state).await?;
        self.jobs.fail(job.id, message).await?;
        self.documents
            .set_error(document_id, &format!("{} failed: {}", stage, message))
            .await?;

        error!(
            subsystem = "jobs",
            component = "stage_manager",
            op = "fail",
            document_id = %document_id,
            job_id = %job.id,
            stage = %stage,
            retry_count = state.retry_count,
            exhausted = retryable,
            error = %message,
            "Stage failed permanently"
        );
        Ok(FailOutcome::Failed {
            exhausted: retryable,
        })
    }

    /// Operator reset: put the document back at `stage`, queued, with no error.
    ///
    /// The caller enqueues the job.
    pub async fn reset_to(&self, document_id: Uuid, stage: PipelineStage) -> Result<StageState> {
        let mut state = self
            .stages
            .get(document_id)
            .await?
            .unwrap_or_else(|| StageState::new(document_id));
        if let Some(previous) = stage.previous() {
            if !state.has_completed(previous) {
                return Err(Error::InvalidInput(format!(
                    "cannot reset document {} to {} before {} has completed",
                    document_id, stage, previous
                )));
            }
        }

        state.current_stage = stage;
        state.status = StageStatus::Queued;
        state.retry_count = 0;
        state.last_error = None;
        state.updated_at = Utc::now();
        self.stages.upsert(&state).await?;
        self.documents.clear_error(document_id).await?;
        self.documents
            .update_status(document_id, DocumentStatus::for_stage(stage))
            .await?;

        info!(
            subsystem = "jobs",
            component = "stage_manager",
            op = "reset_to",
            document_id = %document_id,
            stage = %stage,
            "Stage reset"
        );
        Ok(state)
    }
}
