//! Structured logging field names shared by every dealgraph crate.
//!
//! Use these constants (or the identical literal in `info!(field = ...)`
//! macros) so log aggregation can query the same field across subsystems.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention (usage write lost, job exhausted) |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events, stage and ingestion completions |
//! | DEBUG | Decision points, resolved models, skipped work |
//! | TRACE | Per-item iteration (chunks, entities) |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "api", "db", "inference", "graph", "jobs"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "resolver", "fallback_chain", "usage_logger", "worker", "stage_manager"
pub const COMPONENT: &str = "component";

/// Logical operation name.
pub const OPERATION: &str = "op";

/// Correlation ID for an API request.
pub const REQUEST_ID: &str = "request_id";

// ─── Entity fields ─────────────────────────────────────────────────────────

pub const DOCUMENT_ID: &str = "document_id";

pub const JOB_ID: &str = "job_id";

/// Pipeline stage name ("parse", "embed", "graph_ingest", "analyze").
pub const STAGE: &str = "stage";

/// `{organization_id}:{deal_id}` isolation key.
pub const NAMESPACE: &str = "namespace";

pub const EPISODE: &str = "episode";

// ─── Inference fields ──────────────────────────────────────────────────────

/// Full `provider:model` id.
pub const MODEL: &str = "model";

pub const PROVIDER: &str = "provider";

/// Usage feature label ("graph_extraction", "embedding", ...).
pub const FEATURE: &str = "feature";

pub const AGENT: &str = "agent";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

pub const CHUNK_COUNT: &str = "chunk_count";

/// Number of input texts sent to an embedding model.
pub const INPUT_COUNT: &str = "input_count";

pub const RETRY_COUNT: &str = "retry_count";

pub const COST_USD: &str = "cost_usd";

// ─── Outcome fields ────────────────────────────────────────────────────────

pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
