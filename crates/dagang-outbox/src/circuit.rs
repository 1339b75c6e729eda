//! Circuit breaker protecting the delivery endpoint and the queue.
//!
//! A single process-wide tri-state gate. While CLOSED every dispatch cycle
//! runs; consecutive failure signals open the circuit, which blocks whole
//! cycles until a timeout elapses, after which one probing cycle is let
//! through in HALF_OPEN. The breaker holds no persisted identity: a process
//! restart rebuilds it CLOSED.
//!
//! ```text
//!        failure_threshold reached           open_timeout elapsed
//! CLOSED ───────────────────────────▶ OPEN ──────────────────────▶ HALF_OPEN
//!    ▲                                 ▲                               │
//!    │            success              │           failure             │
//!    └─────────────────────────────────┴───────────────────────────────┘
//! ```

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dagang_core::time::{Clock, ClockExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failure signals that trip the circuit open.
    pub failure_threshold: u32,
    /// Time the circuit stays open before admitting a probe cycle.
    pub open_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, open_timeout: Duration::from_secs(30) }
    }
}

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, cycles allowed.
    Closed,
    /// Cycles blocked until the open timeout elapses.
    Open,
    /// Probing recovery; the next cycle runs and decides the outcome.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Read-only view of breaker state for health reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failure counter.
    pub failure_count: u32,
    /// When the most recent failure signal arrived.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// When an OPEN circuit next admits a probe.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
}

/// Process-wide circuit breaker gating dispatch cycles.
///
/// Mutated only by the dispatcher's gate check and post-cycle aggregation;
/// other components read it through [`CircuitBreaker::snapshot`].
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a breaker in the CLOSED state.
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
                next_attempt_at: None,
            }),
        }
    }

    /// Whether the next dispatch cycle may run.
    ///
    /// An OPEN circuit whose timeout has elapsed self-transitions to
    /// HALF_OPEN here, admitting the caller as the probe.
    pub async fn allow_cycle(&self) -> bool {
        let mut inner = self.inner.lock().await;

        if inner.state == CircuitState::Open {
            let due = inner.next_attempt_at.is_some_and(|at| self.clock.now_utc() >= at);
            if due {
                tracing::info!("circuit breaker transitioning to half-open for probe");
                inner.state = CircuitState::HalfOpen;
                inner.next_attempt_at = None;
            }
        }

        inner.state != CircuitState::Open
    }

    /// Records a failure signal from a dispatch cycle.
    pub async fn record_failure(&self) {
        let now = self.clock.now_utc();
        let mut inner = self.inner.lock().await;
        inner.last_failure_at = Some(now);

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.trip_open(&mut inner, now);
                }
            },
            CircuitState::HalfOpen => {
                inner.failure_count += 1;
                self.trip_open(&mut inner, now);
            },
            CircuitState::Open => {},
        }
    }

    /// Records a success signal from a dispatch cycle.
    ///
    /// While CLOSED the failure counter decays by one instead of resetting,
    /// so isolated successes absorb noise without full amnesia.
    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = inner.failure_count.saturating_sub(1);
            },
            CircuitState::HalfOpen => {
                tracing::info!("circuit breaker closing, endpoint recovered");
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.next_attempt_at = None;
            },
            CircuitState::Open => {
                tracing::warn!("success signal recorded while circuit open");
            },
        }
    }

    /// Returns a read-only snapshot of the breaker.
    pub async fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().await;
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_at: inner.last_failure_at,
            next_attempt_at: inner.next_attempt_at,
        }
    }

    fn trip_open(&self, inner: &mut BreakerInner, now: DateTime<Utc>) {
        tracing::warn!(failure_count = inner.failure_count, "circuit breaker opening");
        inner.state = CircuitState::Open;
        inner.next_attempt_at = Some(
            now + chrono::Duration::from_std(self.config.open_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30)),
        );
    }
}
