//! Per-call usage and cost accounting.
//!
//! [`UsageLogger::log`] is the only entry point callers use and it never
//! fails: a lost usage row must not fail the call that produced it. All
//! fallible work lives in [`UsageLogger::try_log`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error};
use uuid::Uuid;

use dealgraph_core::{
    defaults, Error, ModelId, PricingTable, Result, UsageContext, UsageMetrics, UsageRecord,
    UsageRepository,
};

pub struct UsageLogger {
    repo: Arc<dyn UsageRepository>,
    pricing: Arc<PricingTable>,
    timeout: Duration,
}

impl UsageLogger {
    pub fn new(repo: Arc<dyn UsageRepository>, pricing: Arc<PricingTable>) -> Self {
        Self {
            repo,
            pricing,
            timeout: Duration::from_millis(defaults::USAGE_WRITE_TIMEOUT_MS),
        }
    }

    /// Create with the write timeout from `USAGE_WRITE_TIMEOUT_MS` (default 2000).
    pub fn from_env(repo: Arc<dyn UsageRepository>, pricing: Arc<PricingTable>) -> Self {
        let timeout_ms = std::env::var("USAGE_WRITE_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults::USAGE_WRITE_TIMEOUT_MS);
        Self::new(repo, pricing).with_timeout(Duration::from_millis(timeout_ms))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// USD cost of a call. Models missing from the pricing table cost nothing.
    pub fn cost(&self, model_id: &ModelId, metrics: &UsageMetrics) -> f64 {
        match self.pricing.get(model_id) {
            Some(pricing) => pricing.cost(metrics.input_tokens, metrics.output_tokens),
            None => {
                debug!(
                    subsystem = "inference",
                    component = "usage_logger",
                    model = %model_id,
                    "No pricing entry, recording zero cost"
                );
                0.0
            }
        }
    }

    pub fn build_record(
        &self,
        metrics: &UsageMetrics,
        model_id: &ModelId,
        feature: &str,
        context: &UsageContext,
    ) -> UsageRecord {
        UsageRecord {
            provider: model_id.provider().to_string(),
            model: model_id.model().to_string(),
            feature: feature.to_string(),
            input_tokens: metrics.input_tokens as i64,
            output_tokens: metrics.output_tokens as i64,
            cost_usd: self.cost(model_id, metrics),
            latency_ms: metrics.latency_ms as i64,
            organization_id: context.organization_id.clone(),
            deal_id: context.deal_id.clone(),
            user_id: context.user_id.clone(),
            created_at: Utc::now(),
        }
    }

    /// Persist a usage record, bounded by the write timeout.
    pub async fn try_log(
        &self,
        metrics: &UsageMetrics,
        model_id: &ModelId,
        feature: &str,
        context: &UsageContext,
    ) -> Result<Uuid> {
        let record = self.build_record(metrics, model_id, feature, context);
        let id = tokio::time::timeout(self.timeout, self.repo.insert_usage_record(&record))
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "usage write exceeded {}ms",
                    self.timeout.as_millis()
                ))
            })??;
        debug!(
            subsystem = "inference",
            component = "usage_logger",
            op = "log",
            model = %model_id,
            feature,
            cost_usd = record.cost_usd,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            "Usage recorded"
        );
        Ok(id)
    }

    /// Record usage; failures are logged at ERROR and swallowed.
    pub async fn log(
        &self,
        metrics: &UsageMetrics,
        model_id: &ModelId,
        feature: &str,
        context: &UsageContext,
    ) {
        if let Err(e) = self.try_log(metrics, model_id, feature, context).await {
            error!(
                subsystem = "inference",
                component = "usage_logger",
                provider = %model_id.provider(),
                model = %model_id.model(),
                feature,
                error = %e,
                "Failed to record usage"
            );
        }
    }
}
