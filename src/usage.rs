use crate::config::UsageConfig;
use crate::db::{self, DbKind};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::AnyPool;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub used: i64,
    pub limit: i64,
}

/// Rolling-period cap on agent invocations, backed by the append-only usage ledger.
#[derive(Clone)]
pub struct UsageGovernor {
    pool: AnyPool,
    kind: DbKind,
    config: UsageConfig,
}

impl UsageGovernor {
    pub fn new(pool: AnyPool, kind: DbKind, config: UsageConfig) -> Self {
        Self { pool, kind, config }
    }

    pub fn period(&self) -> Duration {
        Duration::hours(self.config.period_hours.max(1))
    }

    pub fn cost_per_run(&self) -> i64 {
        self.config.cost_per_run
    }

    pub async fn check_rate_limit(&self, account_id: &str, now: DateTime<Utc>) -> Result<RateLimitDecision> {
        let used = db::sum_usage_since(&self.pool, self.kind, account_id, now - self.period()).await?;
        Ok(decide(used, self.config.max_cost_per_period))
    }

    pub async fn record_usage(&self, account_id: &str, cost: i64, run_id: Option<&str>, now: DateTime<Utc>) -> Result<()> {
        db::insert_usage(&self.pool, self.kind, account_id, cost, run_id, now).await
    }
}

fn decide(used: i64, limit: i64) -> RateLimitDecision {
    RateLimitDecision {
        allowed: used < limit,
        used,
        limit,
    }
}
