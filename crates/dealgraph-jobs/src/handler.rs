//! Stage handler trait and the context handed to each handler.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use dealgraph_core::{Document, Error, Job, Namespace, PipelineStage, Result, StagePayload};

/// Progress callback type for stage handlers.
pub type ProgressCallback = Box<dyn Fn(i32, Option<&str>) + Send + Sync>;

/// Everything a handler needs to run one stage for one document.
///
/// The namespace is built once by the worker from the job payload and every
/// lower layer receives it from here.
pub struct JobContext {
    /// The claimed job.
    pub job: Job,
    pub payload: StagePayload,
    pub namespace: Namespace,
    /// Document row as loaded when the stage began.
    pub document: Document,
    /// True when this stage already failed transiently for this document.
    pub is_retry: bool,
    progress_callback: Option<ProgressCallback>,
}

impl JobContext {
    pub fn new(job: Job, payload: StagePayload, namespace: Namespace, document: Document) -> Self {
        Self {
            job,
            payload,
            namespace,
            document,
            is_retry: false,
            progress_callback: None,
        }
    }

    pub fn with_retry(mut self, is_retry: bool) -> Self {
        self.is_retry = is_retry;
        self
    }

    /// Set the progress callback.
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(i32, Option<&str>) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
        self
    }

    /// Report progress to the callback.
    pub fn report_progress(&self, percent: i32, message: Option<&str>) {
        if let Some(ref callback) = self.progress_callback {
            callback(percent, message);
        }
    }

    pub fn document_id(&self) -> Uuid {
        self.payload.document_id
    }

    pub fn stage(&self) -> PipelineStage {
        self.job.stage
    }
}

/// Result of running a stage handler.
#[derive(Debug)]
pub enum JobResult {
    /// Stage completed with optional result data.
    Success(Option<JsonValue>),
    /// Transient failure; the stage is retried with backoff.
    Retry(Error),
    /// Permanent failure; the document needs operator attention.
    Failed(Error),
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Success(_))
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            JobResult::Success(_) => None,
            JobResult::Retry(e) | JobResult::Failed(e) => Some(e),
        }
    }
}

impl From<Error> for JobResult {
    fn from(e: Error) -> Self {
        if e.is_retryable() {
            JobResult::Retry(e)
        } else {
            JobResult::Failed(e)
        }
    }
}

impl From<Result<Option<JsonValue>>> for JobResult {
    fn from(result: Result<Option<JsonValue>>) -> Self {
        match result {
            Ok(data) => JobResult::Success(data),
            Err(e) => e.into(),
        }
    }
}

/// A handler for one pipeline stage.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The stage this handler runs.
    fn stage(&self) -> PipelineStage;

    async fn execute(&self, ctx: JobContext) -> JobResult;

    fn can_handle(&self, stage: PipelineStage) -> bool {
        self.stage() == stage
    }
}
