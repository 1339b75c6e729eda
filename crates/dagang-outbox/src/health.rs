//! Health reporting over the delivery pipeline.
//!
//! Aggregates queue depth, circuit breaker state, and the recent cycle
//! failure ratio into a single verdict suitable for a health endpoint or
//! a periodic operator log line.

use std::{collections::HashMap, sync::Arc};

use dagang_core::{error::Result, models::ItemStatus};
use serde::{Deserialize, Serialize};

use crate::{
    circuit::{BreakerSnapshot, CircuitBreaker, CircuitState},
    dispatcher::DispatchStats,
    store::QueueStore,
};

/// Thresholds for health verdicts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Pending plus retry-scheduled backlog that degrades the verdict.
    pub backlog_threshold: u64,
    /// Recent cycle failure ratio at which the service is unhealthy.
    pub failure_ratio_threshold: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { backlog_threshold: 1_000, failure_ratio_threshold: 0.5 }
    }
}

/// Overall verdict, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Delivering normally.
    Healthy,
    /// Operational but impaired: open or probing circuit, or deep backlog.
    Degraded,
    /// Most recent cycles are failing.
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Point-in-time view of pipeline health.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Overall verdict.
    pub status: HealthStatus,
    /// Item counts per queue status.
    pub queue_counts: HashMap<ItemStatus, u64>,
    /// Items still owed a delivery: pending plus retry-scheduled failures.
    /// Permanent failures are terminal and excluded.
    pub backlog: u64,
    /// Circuit breaker view.
    pub circuit: BreakerSnapshot,
    /// Failure ratio over recent executed cycles.
    pub failure_ratio: f64,
    /// Lifetime delivered count.
    pub items_delivered: u64,
    /// Lifetime permanently failed count.
    pub items_exhausted: u64,
}

/// Computes health snapshots from live pipeline components.
pub struct HealthReporter {
    store: Arc<dyn QueueStore>,
    breaker: Arc<CircuitBreaker>,
    stats: Arc<DispatchStats>,
    config: HealthConfig,
}

impl HealthReporter {
    /// Creates a reporter over shared pipeline handles.
    pub fn new(
        store: Arc<dyn QueueStore>,
        breaker: Arc<CircuitBreaker>,
        stats: Arc<DispatchStats>,
        config: HealthConfig,
    ) -> Self {
        Self { store, breaker, stats, config }
    }

    /// Produces a current health snapshot.
    ///
    /// The verdict takes the worst applicable signal: a failing cycle
    /// ratio is unhealthy; an open or probing circuit or a deep backlog is
    /// degraded; otherwise healthy.
    pub async fn snapshot(&self) -> Result<HealthSnapshot> {
        let queue_counts = self.store.count_by_status().await?;
        let backlog = self.store.count_backlog().await?;
        let circuit = self.breaker.snapshot().await;
        let failure_ratio = self.stats.recent_failure_ratio().await;

        let mut status = HealthStatus::Healthy;
        if circuit.state != CircuitState::Closed || backlog >= self.config.backlog_threshold {
            status = HealthStatus::Degraded;
        }
        if failure_ratio >= self.config.failure_ratio_threshold {
            status = HealthStatus::Unhealthy;
        }

        Ok(HealthSnapshot {
            status,
            queue_counts,
            backlog,
            circuit,
            failure_ratio,
            items_delivered: self.stats.items_delivered(),
            items_exhausted: self.stats.items_exhausted(),
        })
    }
}
