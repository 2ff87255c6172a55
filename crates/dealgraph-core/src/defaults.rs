//! Centralized default constants for dealgraph.
//!
//! Crates reference these instead of defining their own magic numbers.
//! Every `from_env()` constructor falls back to the values here.

// =============================================================================
// MODELS
// =============================================================================

/// Sampling temperature when an agent's settings omit it.
pub const MODEL_TEMPERATURE: f32 = 0.0;

/// Maximum output tokens when an agent's settings omit it.
pub const MODEL_MAX_TOKENS: u32 = 4096;

/// Agent model configuration file.
pub const MODELS_FILE: &str = "config/models.yaml";

/// Environment variable naming the agent model configuration file.
pub const ENV_MODELS_FILE: &str = "DEALGRAPH_MODELS_FILE";

// =============================================================================
// PROVIDERS
// =============================================================================

/// TCP connect timeout for provider HTTP clients, seconds.
pub const PROVIDER_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Whole-request timeout for provider HTTP clients, seconds.
pub const PROVIDER_TIMEOUT_SECS: u64 = 60;

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Gemini's OpenAI-compatible surface.
pub const GOOGLE_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";

pub const VOYAGE_BASE_URL: &str = "https://api.voyageai.com/v1";

pub const OLLAMA_BASE_URL: &str = "http://127.0.0.1:11434/v1";

// =============================================================================
// USAGE LOGGING
// =============================================================================

/// Upper bound on a single usage record write, milliseconds.
pub const USAGE_WRITE_TIMEOUT_MS: u64 = 2_000;

/// Feature label for extraction calls made during graph ingestion.
pub const FEATURE_GRAPH_EXTRACTION: &str = "graph_extraction";

/// Feature label for embedding calls made during graph ingestion.
pub const FEATURE_GRAPH_EMBEDDING: &str = "graph_embedding";

/// Feature label for chunk embedding.
pub const FEATURE_EMBEDDING: &str = "embedding";

pub const FEATURE_DOCUMENT_ANALYSIS: &str = "document_analysis";

pub const FEATURE_SPECIALIST: &str = "specialist";

// =============================================================================
// INGESTION
// =============================================================================

/// Log ingestion progress every N chunks.
pub const INGEST_PROGRESS_EVERY: usize = 10;

/// Characters per token for the directional cost estimate.
pub const CHARS_PER_TOKEN: usize = 4;

/// Characters of chunk content fed to the document analysis prompt.
pub const ANALYSIS_MAX_CHARS: usize = 24_000;

/// Graph hits passed to the specialist agent.
pub const GRAPH_SEARCH_LIMIT: usize = 20;

// =============================================================================
// EMBEDDING
// =============================================================================

/// Expected embedding dimension (voyage-finance-2, text-embedding-3-small at 1024 dims).
pub const EMBED_DIMENSION: usize = 1024;

/// Texts per embedding request.
pub const EMBED_BATCH_SIZE: usize = 64;

// =============================================================================
// JOB PROCESSING
// =============================================================================

/// Default maximum retry count for a stage job.
pub const JOB_MAX_RETRIES: i32 = 3;

/// Idle poll interval when the queue is empty, milliseconds.
pub const JOB_POLL_INTERVAL_MS: u64 = 1_000;

/// Default maximum concurrent jobs per worker.
pub const JOB_MAX_CONCURRENT: usize = 4;

/// Default job execution timeout in seconds (15 minutes; large workbooks ingest slowly).
pub const JOB_TIMEOUT_SECS: u64 = 900;

/// Base delay for exponential retry backoff, seconds.
pub const RETRY_BASE_DELAY_SECS: u64 = 30;

/// Upper bound on a single retry delay, seconds.
pub const RETRY_MAX_DELAY_SECS: u64 = 900;

// =============================================================================
// DATABASE
// =============================================================================

pub const DB_MAX_CONNECTIONS: u32 = 20;

pub const DB_MIN_CONNECTIONS: u32 = 2;

pub const DB_ACQUIRE_TIMEOUT_SECS: u64 = 30;

pub const DB_IDLE_TIMEOUT_SECS: u64 = 600;

/// Interval between pool size/idle log lines, seconds.
pub const DB_POOL_METRICS_INTERVAL_SECS: u64 = 60;

// =============================================================================
// SERVER
// =============================================================================

pub const SERVER_PORT: u16 = 3000;

/// Request body limit for API calls, bytes.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;
