//! Append-only LLM usage ledger.

use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use dealgraph_core::{new_v7, Error, Result, UsageRecord, UsageRepository};

pub struct PgUsageRepository {
    pool: Pool<Postgres>,
}

impl PgUsageRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Total recorded spend for a deal.
    pub async fn total_cost_for_deal(&self, organization_id: &str, deal_id: &str) -> Result<f64> {
        let total: Option<f64> = sqlx::query_scalar(
            "SELECT SUM(cost_usd) FROM llm_usage WHERE organization_id = $1 AND deal_id = $2",
        )
        .bind(organization_id)
        .bind(deal_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(total.unwrap_or(0.0))
    }
}

#[async_trait]
impl UsageRepository for PgUsageRepository {
    async fn insert_usage_record(&self, record: &UsageRecord) -> Result<Uuid> {
        let id = new_v7();
        sqlx::query(
            "INSERT INTO llm_usage
                 (id, provider, model, feature, input_tokens, output_tokens, cost_usd, latency_ms,
                  organization_id, deal_id, user_id, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(id)
        .bind(&record.provider)
        .bind(&record.model)
        .bind(&record.feature)
        .bind(record.input_tokens)
        .bind(record.output_tokens)
        .bind(record.cost_usd)
        .bind(record.latency_ms)
        .bind(&record.organization_id)
        .bind(&record.deal_id)
        .bind(&record.user_id)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(id)
    }
}
