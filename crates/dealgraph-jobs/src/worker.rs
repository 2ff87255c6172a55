//! Job worker: claims stage jobs and drives them through the stage manager.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, Notify, RwLock};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use dealgraph_core::{defaults, Error, Job, JobRepository, PipelineStage, Result, StagePayload};

use crate::handler::{JobContext, JobHandler, JobResult};
use crate::handlers::PipelineDeps;
use crate::stage::{BeginOutcome, FailOutcome, StageManager};

/// Capacity of the worker event channel.
const EVENT_CAPACITY: usize = 256;

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Polling interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum number of concurrent jobs.
    pub max_concurrent_jobs: usize,
    /// Upper bound on a single handler run.
    pub job_timeout: Duration,
    /// Whether to enable job processing.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::JOB_POLL_INTERVAL_MS,
            max_concurrent_jobs: defaults::JOB_MAX_CONCURRENT,
            job_timeout: Duration::from_secs(defaults::JOB_TIMEOUT_SECS),
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_MAX_CONCURRENT` | `4` | Max concurrent jobs |
    /// | `JOB_POLL_INTERVAL_MS` | `1000` | Polling interval when queue is empty |
    /// | `JOB_TIMEOUT_SECS` | `900` | Per-job handler timeout |
    pub fn from_env() -> Self {
        let enabled = std::env::var("JOB_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let max_concurrent_jobs = std::env::var("JOB_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::JOB_MAX_CONCURRENT)
            .max(1);

        let poll_interval_ms = std::env::var("JOB_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_POLL_INTERVAL_MS);

        let job_timeout = std::env::var("JOB_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(defaults::JOB_TIMEOUT_SECS));

        Self {
            poll_interval_ms,
            max_concurrent_jobs,
            job_timeout,
            enabled,
        }
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Event emitted by the job worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    JobStarted {
        job_id: Uuid,
        stage: PipelineStage,
    },
    JobProgress {
        job_id: Uuid,
        percent: i32,
        message: Option<String>,
    },
    /// Stage finished; `next_job` is the follow-on job, if any.
    JobCompleted {
        job_id: Uuid,
        stage: PipelineStage,
        next_job: Option<Uuid>,
    },
    /// Stage was already done; the job was acknowledged without running.
    JobSkipped {
        job_id: Uuid,
        stage: PipelineStage,
    },
    /// Stage failed transiently and went back to the queue.
    JobRetrying {
        job_id: Uuid,
        stage: PipelineStage,
        retry_count: i32,
        delay: Duration,
    },
    /// Stage failed permanently.
    JobFailed {
        job_id: Uuid,
        stage: PipelineStage,
        error: String,
    },
    WorkerStarted,
    WorkerStopped,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
}

impl WorkerHandle {
    /// Signal the worker to stop claiming; in-flight jobs run to completion.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

type HandlerMap = Arc<RwLock<HashMap<PipelineStage, Arc<dyn JobHandler>>>>;

/// Job worker that processes stage jobs from the queue.
pub struct JobWorker {
    jobs: Arc<dyn JobRepository>,
    stages: Arc<StageManager>,
    config: WorkerConfig,
    handlers: HandlerMap,
    event_tx: broadcast::Sender<WorkerEvent>,
    wake: Option<Arc<Notify>>,
}

impl JobWorker {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        stages: Arc<StageManager>,
        config: WorkerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            jobs,
            stages,
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            wake: None,
        }
    }

    /// Wake from the idle wait when `notify` fires instead of waiting out
    /// the poll interval.
    pub fn with_wake(mut self, notify: Arc<Notify>) -> Self {
        self.wake = Some(notify);
        self
    }

    /// Register a handler for its stage, replacing any earlier one.
    pub async fn register_handler(&self, handler: Arc<dyn JobHandler>) {
        let stage = handler.stage();
        self.handlers.write().await.insert(stage, handler);
        debug!(%stage, "Registered stage handler");
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
        }
    }

    /// Keep up to `max_concurrent_jobs` jobs in flight, refilling as they finish.
    ///
    /// Sleeps only when nothing could be claimed; an enqueue signal on the
    /// wake handle cuts the sleep short. On shutdown, stops claiming and
    /// waits for in-flight jobs.
    #[instrument(skip(self, shutdown_rx), fields(subsystem = "jobs", component = "worker"))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Job worker is disabled, not starting");
            return;
        }

        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            max_concurrent = self.config.max_concurrent_jobs,
            job_timeout_secs = self.config.job_timeout.as_secs(),
            "Job worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut tasks = JoinSet::new();

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!("Job worker received shutdown signal");
                break;
            }

            let mut claimed = 0;
            while tasks.len() < self.config.max_concurrent_jobs {
                match self.claim_job().await {
                    Some(job) => {
                        claimed += 1;
                        let runner = self.runner();
                        tasks.spawn(async move { runner.execute_job(job).await });
                    }
                    None => break,
                }
            }
            if claimed > 0 {
                debug!(claimed, in_flight = tasks.len(), "Claimed jobs");
            }

            if tasks.is_empty() {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Job worker received shutdown signal");
                        break;
                    }
                    _ = sleep(poll_interval) => {}
                    _ = wait_for_wake(self.wake.as_deref()) => {
                        debug!("Woken by enqueue");
                    }
                }
            } else {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Job worker received shutdown signal");
                        break;
                    }
                    Some(result) = tasks.join_next() => {
                        if let Err(e) = result {
                            error!(error = ?e, "Job task panicked");
                        }
                    }
                    _ = sleep(poll_interval) => {}
                    _ = wait_for_wake(self.wake.as_deref()),
                        if tasks.len() < self.config.max_concurrent_jobs => {}
                }
            }
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = ?e, "Job task panicked");
            }
        }
        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Job worker stopped");
    }

    async fn claim_job(&self) -> Option<Job> {
        let stages: Vec<PipelineStage> = self.handlers.read().await.keys().copied().collect();
        if stages.is_empty() {
            return None;
        }
        match self.jobs.claim_next(&stages).await {
            Ok(job) => job,
            Err(e) => {
                error!(error = %e, "Failed to claim job");
                None
            }
        }
    }

    fn runner(&self) -> JobRunner {
        JobRunner {
            jobs: self.jobs.clone(),
            stages: self.stages.clone(),
            handlers: self.handlers.clone(),
            event_tx: self.event_tx.clone(),
            job_timeout: self.config.job_timeout,
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    pub async fn pending_count(&self) -> Result<i64> {
        self.jobs.pending_count().await
    }

    /// Claim and run at most one job on the current task.
    ///
    /// Returns the id of the job that was processed.
    pub async fn run_once(&self) -> Option<Uuid> {
        let job = self.claim_job().await?;
        let id = job.id;
        self.runner().execute_job(job).await;
        Some(id)
    }
}

async fn wait_for_wake(wake: Option<&Notify>) {
    match wake {
        Some(notify) => notify.notified().await,
        None => std::future::pending().await,
    }
}

/// Everything one spawned job needs, detached from the worker.
struct JobRunner {
    jobs: Arc<dyn JobRepository>,
    stages: Arc<StageManager>,
    handlers: HandlerMap,
    event_tx: broadcast::Sender<WorkerEvent>,
    job_timeout: Duration,
}

impl JobRunner {
    #[instrument(
        skip(self, job),
        fields(
            subsystem = "jobs",
            component = "worker",
            job_id = %job.id,
            stage = %job.stage,
        )
    )]
    async fn execute_job(self, job: Job) {
        let start = Instant::now();
        let job_id = job.id;
        let stage = job.stage;
        let _ = self
            .event_tx
            .send(WorkerEvent::JobStarted { job_id, stage });

        let payload = match StagePayload::from_json(&job.payload) {
            Ok(payload) => payload,
            Err(e) => {
                self.reject(&job, &e).await;
                return;
            }
        };
        let namespace = match payload.namespace() {
            Ok(ns) => ns,
            Err(e) => {
                self.reject(&job, &e).await;
                return;
            }
        };

        let handler = self.handlers.read().await.get(&stage).cloned();
        let Some(handler) = handler else {
            warn!("No handler registered for stage");
            self.reject(&job, &Error::Job(format!("no handler for stage {}", stage)))
                .await;
            return;
        };

        let run = match self.stages.begin(&job, &payload).await {
            Ok(BeginOutcome::Proceed(run)) => run,
            Ok(BeginOutcome::AlreadyCompleted(_)) => {
                self.acknowledge_completed(&job, &payload).await;
                return;
            }
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "Could not enter stage, requeueing");
                let delay = self.stages.policy().delay_for(0);
                if let Err(e) = self.jobs.retry_later(job_id, &e.to_string(), delay).await {
                    error!(error = %e, "Failed to requeue job");
                }
                return;
            }
            Err(e) => {
                self.reject(&job, &e).await;
                return;
            }
        };

        let event_tx = self.event_tx.clone();
        let ctx = JobContext::new(job.clone(), payload.clone(), namespace, run.document)
            .with_retry(run.is_retry)
            .with_progress_callback(move |percent, message| {
                let _ = event_tx.send(WorkerEvent::JobProgress {
                    job_id,
                    percent,
                    message: message.map(String::from),
                });
            });

        let result = match tokio::time::timeout(self.job_timeout, handler.execute(ctx)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    timeout_secs = self.job_timeout.as_secs(),
                    "Job exceeded timeout"
                );
                JobResult::Retry(Error::Timeout(format!(
                    "{} exceeded timeout of {}s",
                    stage,
                    self.job_timeout.as_secs()
                )))
            }
        };

        match result {
            JobResult::Success(_) => {
                match self.finish(&job, &payload).await {
                    Ok(next_job) => {
                        info!(
                            duration_ms = start.elapsed().as_millis() as u64,
                            next_job = ?next_job,
                            "Job completed successfully"
                        );
                        let _ = self.event_tx.send(WorkerEvent::JobCompleted {
                            job_id,
                            stage,
                            next_job,
                        });
                    }
                    Err(e) => {
                        // The redelivered job sees the stage completed and only advances.
                        error!(error = %e, "Failed to record stage completion, requeueing");
                        let delay = self.stages.policy().delay_for(0);
                        if let Err(e) = self.jobs.retry_later(job_id, &e.to_string(), delay).await
                        {
                            error!(error = %e, "Failed to requeue job");
                        }
                    }
                }
            }
            JobResult::Retry(e) => self.record_failure(&job, &e, true, start).await,
            JobResult::Failed(e) => self.record_failure(&job, &e, false, start).await,
        }
    }

    async fn finish(&self, job: &Job, payload: &StagePayload) -> Result<Option<Uuid>> {
        self.stages.complete(payload.document_id, job.stage).await?;
        let next_job = self.stages.advance(payload, job.stage).await?;
        self.jobs.complete(job.id).await?;
        Ok(next_job)
    }

    async fn advance_and_ack(&self, job: &Job, payload: &StagePayload) -> Result<()> {
        self.stages.advance(payload, job.stage).await?;
        self.jobs.complete(job.id).await
    }

    async fn acknowledge_completed(&self, job: &Job, payload: &StagePayload) {
        match self.advance_and_ack(job, payload).await {
            Ok(()) => {
                debug!("Stage already completed, job acknowledged");
                let _ = self.event_tx.send(WorkerEvent::JobSkipped {
                    job_id: job.id,
                    stage: job.stage,
                });
            }
            Err(e) => error!(error = %e, "Failed to acknowledge completed stage"),
        }
    }

    async fn record_failure(&self, job: &Job, err: &Error, retryable: bool, start: Instant) {
        let message = err.to_string();
        match self.stages.fail(job, &message, retryable).await {
            Ok(FailOutcome::Retrying { retry_count, delay }) => {
                let _ = self.event_tx.send(WorkerEvent::JobRetrying {
                    job_id: job.id,
                    stage: job.stage,
                    retry_count,
                    delay,
                });
            }
            Ok(FailOutcome::Failed { exhausted }) => {
                warn!(
                    error = %message,
                    exhausted,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Job failed"
                );
                let _ = self.event_tx.send(WorkerEvent::JobFailed {
                    job_id: job.id,
                    stage: job.stage,
                    error: message,
                });
            }
            Err(e) => {
                error!(error = %e, original = %message, "Failed to record stage failure");
                if let Err(e) = self.jobs.fail(job.id, &message).await {
                    error!(error = %e, "Failed to mark job as failed");
                }
            }
        }
    }

    /// Fail a job that never entered its stage. Stage state is left untouched.
    async fn reject(&self, job: &Job, err: &Error) {
        let message = err.to_string();
        error!(error = %message, "Job rejected");
        if let Err(e) = self.jobs.fail(job.id, &message).await {
            error!(error = %e, "Failed to mark job as failed");
        }
        let _ = self.event_tx.send(WorkerEvent::JobFailed {
            job_id: job.id,
            stage: job.stage,
            error: message,
        });
    }
}

/// Builder for creating a job worker with handlers.
pub struct WorkerBuilder {
    jobs: Arc<dyn JobRepository>,
    stages: Arc<StageManager>,
    config: WorkerConfig,
    handlers: Vec<Arc<dyn JobHandler>>,
    wake: Option<Arc<Notify>>,
}

impl WorkerBuilder {
    pub fn new(jobs: Arc<dyn JobRepository>, stages: Arc<StageManager>) -> Self {
        Self {
            jobs,
            stages,
            config: WorkerConfig::default(),
            handlers: Vec::new(),
            wake: None,
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_handler<H: JobHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Register the four stage handlers built from `deps`.
    pub fn with_pipeline(mut self, deps: &PipelineDeps) -> Self {
        self.handlers.extend(deps.handlers());
        self
    }

    /// Notify handle signalled by the job repository on enqueue.
    pub fn with_wake(mut self, notify: Arc<Notify>) -> Self {
        self.wake = Some(notify);
        self
    }

    pub async fn build(self) -> JobWorker {
        let mut worker = JobWorker::new(self.jobs, self.stages, self.config);
        if let Some(notify) = self.wake {
            worker = worker.with_wake(notify);
        }
        for handler in self.handlers {
            worker.register_handler(handler).await;
        }
        worker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval_ms, defaults::JOB_POLL_INTERVAL_MS);
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.job_timeout, Duration::from_secs(900));
        assert!(config.enabled);
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::default()
            .with_poll_interval(10)
            .with_max_concurrent(0)
            .with_job_timeout(Duration::from_secs(5))
            .with_enabled(false);

        assert_eq!(config.poll_interval_ms, 10);
        assert_eq!(config.max_concurrent_jobs, 1);
        assert_eq!(config.job_timeout, Duration::from_secs(5));
        assert!(!config.enabled);
    }

    #[test]
    fn test_worker_event_debug_names_stage() {
        let event = WorkerEvent::JobRetrying {
            job_id: Uuid::new_v4(),
            stage: PipelineStage::GraphIngest,
            retry_count: 2,
            delay: Duration::from_secs(60),
        };
        let debug_str = format!("{:?}", event);
        assert!(debug_str.contains("JobRetrying"));
        assert!(debug_str.contains("GraphIngest"));
    }
}
