//! # dealgraph-db
//!
//! PostgreSQL persistence for the dealgraph pipeline.
//!
//! This crate provides:
//! - Connection pool management
//! - Job queue with `FOR UPDATE SKIP LOCKED` claiming
//! - Document, chunk, stage-state and usage repositories
//! - Namespaced knowledge graph with pgvector similarity search
//! - In-memory implementations of every repository (`memory` feature)
//!
//! ## Example
//!
//! ```rust,ignore
//! use dealgraph_db::{Database, PoolConfig};
//!
//! let db = Database::connect("postgres://localhost/dealgraph", PoolConfig::from_env()).await?;
//! db.migrate().await?;
//! let job_id = db.jobs.enqueue(PipelineStage::Parse, Some(doc_id), payload).await?;
//! ```

pub mod documents;
pub mod graph;
pub mod jobs;
pub mod pool;
pub mod stages;
pub mod usage;

#[cfg(any(test, feature = "memory"))]
pub mod memory;

use std::sync::Arc;

pub use dealgraph_core::*;

pub use documents::PgDocumentRepository;
pub use graph::PgGraphStore;
pub use jobs::PgJobRepository;
pub use pool::{create_pool, log_pool_metrics, PoolConfig};
pub use stages::PgStageRepository;
pub use usage::PgUsageRepository;

/// Escape LIKE/ILIKE wildcard characters (`%`, `_`, `\`) in user input.
pub fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Combined database context with all repositories.
///
/// Repositories are held in `Arc`s so they can be handed to the worker and
/// the API as trait objects.
#[derive(Clone)]
pub struct Database {
    pub pool: sqlx::Pool<sqlx::Postgres>,
    pub jobs: Arc<PgJobRepository>,
    pub documents: Arc<PgDocumentRepository>,
    pub stages: Arc<PgStageRepository>,
    pub usage: Arc<PgUsageRepository>,
    pub graph: Arc<PgGraphStore>,
}

impl Database {
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            jobs: Arc::new(PgJobRepository::new(pool.clone())),
            documents: Arc::new(PgDocumentRepository::new(pool.clone())),
            stages: Arc::new(PgStageRepository::new(pool.clone())),
            usage: Arc::new(PgUsageRepository::new(pool.clone())),
            graph: Arc::new(PgGraphStore::new(pool.clone())),
            pool,
        }
    }

    pub async fn connect(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
        assert_eq!(escape_like("acme"), "acme");
    }
}
