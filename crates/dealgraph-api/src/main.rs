//! dealgraph API server and pipeline worker.
//!
//! | Env Variable | Default | Description |
//! |--------------|---------|-------------|
//! | `DATABASE_URL` | `postgres://localhost/dealgraph` | Postgres connection string |
//! | `HOST` | `0.0.0.0` | Bind address |
//! | `PORT` | 3000 | Bind port |
//! | `ALLOWED_ORIGINS` | (none) | Comma-separated CORS origins |
//! | `DEALGRAPH_API_KEYS` | (none) | Comma-separated API keys |
//! | `LOG_FORMAT` | `text` | `json` or `text` |
//! | `LOG_FILE` | (none) | Log file path, rotated daily |
//! | `LOG_ANSI` | auto | Force ANSI colors on or off |
//!
//! Worker, pool, provider, usage and ingestion settings are read by the
//! `from_env` constructors of their crates.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use dealgraph_api::{cors_layer, parse_allowed_origins, router, ApiKeys, AppState};
use dealgraph_core::{defaults, AgentType, Error};
use dealgraph_db::{log_pool_metrics, Database, PoolConfig};
use dealgraph_graph::{IngestionConfig, IngestionService};
use dealgraph_inference::{
    AgentModels, EmbeddingAdapter, ModelResolver, ProviderSettings, UsageLogger,
};
use dealgraph_jobs::{
    PipelineDeps, RetryPolicy, StageManager, WorkerBuilder, WorkerConfig, WorkerEvent,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "dealgraph_api=debug,dealgraph_jobs=info,dealgraph_graph=info,dealgraph_inference=info,tower_http=debug"
            .into()
    });
    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("dealgraph-api.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/dealgraph".to_string());
    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(defaults::SERVER_PORT);
    let worker_config = WorkerConfig::from_env();

    // Models and providers
    let models = AgentModels::load().context("loading agent model configuration")?;
    let resolver = ModelResolver::new(
        ProviderSettings::from_env().with_worker_count(worker_config.max_concurrent_jobs),
    )?;
    let extraction = Arc::new(resolver.chain_for(models.get(AgentType::GraphExtraction)?)?);
    let embedding = Arc::new(resolver.chain_for(models.get(AgentType::Embedding)?)?);
    let analysis = Arc::new(resolver.chain_for(models.get(AgentType::DocumentAnalysis)?)?);
    let specialist = Arc::new(resolver.chain_for(models.get(AgentType::Specialist)?)?);
    info!(
        extraction = %extraction.primary().id(),
        embedding = %embedding.primary().id(),
        analysis = %analysis.primary().id(),
        specialist = %specialist.primary().id(),
        "Agent models resolved"
    );

    // Database
    info!("Connecting to database...");
    let db = Database::connect(&database_url, PoolConfig::from_env()).await?;
    info!("Database connected");
    info!("Running database migrations...");
    db.migrate().await?;
    info!("Database migrations complete");

    let metrics_pool = db.pool.clone();
    tokio::spawn(async move {
        let mut tick =
            tokio::time::interval(Duration::from_secs(defaults::DB_POOL_METRICS_INTERVAL_SECS));
        loop {
            tick.tick().await;
            log_pool_metrics(&metrics_pool);
        }
    });

    let usage = Arc::new(UsageLogger::from_env(
        db.usage.clone(),
        Arc::new(models.pricing().clone()),
    ));
    let embeddings = Arc::new(EmbeddingAdapter::new(embedding));
    match embeddings.verify_dimension(defaults::EMBED_DIMENSION).await {
        Ok(()) => {}
        Err(e @ Error::Configuration(_)) => return Err(e.into()),
        Err(e) => warn!(error = %e, "Embedding dimension check skipped; provider unreachable"),
    }

    let ingestion = Arc::new(
        IngestionService::new(
            extraction,
            embeddings.clone(),
            db.graph.clone(),
            usage.clone(),
        )
        .with_config(IngestionConfig::from_env()),
    );
    let stages = Arc::new(StageManager::for_database(&db).with_policy(RetryPolicy::from_env()));

    let worker_handle = if worker_config.enabled {
        info!("Starting job worker...");
        let deps = PipelineDeps {
            documents: db.documents.clone(),
            embeddings: embeddings.clone(),
            ingestion,
            analysis,
            usage: usage.clone(),
        };
        let worker = WorkerBuilder::new(db.jobs.clone(), stages.clone())
            .with_config(worker_config.clone())
            .with_wake(db.jobs.job_notify())
            .with_pipeline(&deps)
            .build()
            .await;
        let handle = worker.start();
        info!("Job worker started");
        Some(handle)
    } else {
        info!("Job worker disabled");
        None
    };

    let api_keys = ApiKeys::from_env();
    if api_keys.is_empty() {
        warn!("No API keys configured; every /api request will be rejected");
    }
    let state = AppState {
        documents: db.documents.clone(),
        graph: db.graph.clone(),
        stages,
        embeddings,
        specialist,
        usage,
        api_keys: Arc::new(api_keys),
    };

    let origins = parse_allowed_origins(&std::env::var("ALLOWED_ORIGINS").unwrap_or_default());
    let app = router(state).layer(cors_layer(origins));

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = worker_handle {
        let mut events = handle.events();
        if let Err(e) = handle.shutdown().await {
            error!(error = %e, "Failed to signal worker shutdown");
        } else {
            info!("Waiting for in-flight jobs...");
            let stopped = async {
                loop {
                    match events.recv().await {
                        Ok(WorkerEvent::WorkerStopped) | Err(RecvError::Closed) => break,
                        _ => {}
                    }
                }
            };
            if tokio::time::timeout(worker_config.job_timeout, stopped)
                .await
                .is_err()
            {
                warn!("Worker did not stop before the job timeout");
            }
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
