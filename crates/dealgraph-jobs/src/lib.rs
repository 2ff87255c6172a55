//! # dealgraph-jobs
//!
//! Stage pipeline for dealgraph documents: `parse → embed → graph_ingest →
//! analyze`.
//!
//! This crate provides:
//! - [`StageManager`]: per-document stage state, retry classification and backoff
//! - Stage handlers for each pipeline stage ([`PipelineDeps`])
//! - [`JobWorker`]: concurrent job processing with broadcast events
//!
//! ## Example
//!
//! ```ignore
//! use dealgraph_jobs::{PipelineDeps, StageManager, WorkerBuilder, WorkerConfig};
//!
//! let stages = Arc::new(StageManager::for_database(&db).with_policy(RetryPolicy::from_env()));
//! let worker = WorkerBuilder::new(db.jobs.clone(), stages)
//!     .with_config(WorkerConfig::from_env())
//!     .with_pipeline(&deps)
//!     .build()
//!     .await;
//!
//! let handle = worker.start();
//! let mut events = handle.events();
//! // ...
//! handle.shutdown().await?;
//! ```

pub mod handler;
pub mod handlers;
pub mod stage;
pub mod worker;

pub use handler::{JobContext, JobHandler, JobResult};
pub use handlers::{
    build_analysis_prompt, AnalyzeHandler, EmbedHandler, GraphIngestHandler, ParseHandler,
    PipelineDeps,
};
pub use stage::{BeginOutcome, FailOutcome, RetryPolicy, StageManager, StageRun};
pub use worker::{JobWorker, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle};
