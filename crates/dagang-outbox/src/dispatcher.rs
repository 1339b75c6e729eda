//! Periodic batch dispatcher for queued webhook deliveries.
//!
//! One dispatcher owns the whole pipeline: it polls the store on a fixed
//! interval, claims a batch of due items, fans attempts out to the sender,
//! and feeds per-item outcomes back into the store, the backoff policy, and
//! the circuit breaker. Cycles are single-flight; a tick that arrives while
//! the previous cycle is still running is dropped, not queued.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use dagang_core::{
    models::QueueItem,
    time::{Clock, ClockExt},
};
use tokio::{sync::Mutex, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::BackoffPolicy,
    circuit::CircuitBreaker,
    classify::Classification,
    error::OutboxError,
    sender::WebhookSender,
    store::QueueStore,
};

/// Executed cycles considered when computing the recent failure ratio.
const RECENT_CYCLE_WINDOW: usize = 20;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Interval between poll ticks.
    pub poll_interval: Duration,
    /// Maximum items claimed per cycle.
    pub batch_size: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { poll_interval: Duration::from_secs(5), batch_size: crate::DEFAULT_BATCH_SIZE }
    }
}

/// Outcome of a single dispatch cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A previous cycle was still in flight; this tick did nothing.
    Overlapped,
    /// The circuit breaker blocked the cycle.
    Blocked,
    /// Nothing was due; no work, no breaker signals.
    Idle,
    /// Claiming failed; the cycle aborted and signalled the breaker.
    Aborted,
    /// The cycle ran a claimed batch.
    Completed {
        /// Items delivered successfully.
        delivered: usize,
        /// Items scheduled for retry.
        retried: usize,
        /// Items that failed permanently.
        exhausted: usize,
    },
}

/// Running counters shared with the health reporter.
///
/// Counters are monotonic; the bounded outcome window feeds the recent
/// failure ratio used in health verdicts.
#[derive(Debug)]
pub struct DispatchStats {
    cycles_run: AtomicU64,
    cycles_blocked: AtomicU64,
    cycles_overlapped: AtomicU64,
    items_delivered: AtomicU64,
    items_retried: AtomicU64,
    items_exhausted: AtomicU64,
    claim_errors: AtomicU64,
    recent_outcomes: Mutex<std::collections::VecDeque<bool>>,
}

impl DispatchStats {
    fn new() -> Self {
        Self {
            cycles_run: AtomicU64::new(0),
            cycles_blocked: AtomicU64::new(0),
            cycles_overlapped: AtomicU64::new(0),
            items_delivered: AtomicU64::new(0),
            items_retried: AtomicU64::new(0),
            items_exhausted: AtomicU64::new(0),
            claim_errors: AtomicU64::new(0),
            recent_outcomes: Mutex::new(std::collections::VecDeque::with_capacity(
                RECENT_CYCLE_WINDOW,
            )),
        }
    }

    /// Total executed cycles (idle, aborted, or completed).
    pub fn cycles_run(&self) -> u64 {
        self.cycles_run.load(Ordering::Relaxed)
    }

    /// Cycles blocked by the circuit breaker.
    pub fn cycles_blocked(&self) -> u64 {
        self.cycles_blocked.load(Ordering::Relaxed)
    }

    /// Ticks dropped because a cycle was already in flight.
    pub fn cycles_overlapped(&self) -> u64 {
        self.cycles_overlapped.load(Ordering::Relaxed)
    }

    /// Items delivered successfully.
    pub fn items_delivered(&self) -> u64 {
        self.items_delivered.load(Ordering::Relaxed)
    }

    /// Items scheduled for a retry.
    pub fn items_retried(&self) -> u64 {
        self.items_retried.load(Ordering::Relaxed)
    }

    /// Items that exhausted retries or failed non-retriably.
    pub fn items_exhausted(&self) -> u64 {
        self.items_exhausted.load(Ordering::Relaxed)
    }

    /// Claim operations that returned an error.
    pub fn claim_errors(&self) -> u64 {
        self.claim_errors.load(Ordering::Relaxed)
    }

    /// Fraction of recent executed cycles that were failure-dominated.
    ///
    /// Returns 0.0 until at least one batch cycle has run.
    pub async fn recent_failure_ratio(&self) -> f64 {
        let window = self.recent_outcomes.lock().await;
        if window.is_empty() {
            return 0.0;
        }
        let failed = window.iter().filter(|&&f| f).count();
        failed as f64 / window.len() as f64
    }

    async fn record_cycle_outcome(&self, failed: bool) {
        let mut window = self.recent_outcomes.lock().await;
        if window.len() == RECENT_CYCLE_WINDOW {
            window.pop_front();
        }
        window.push_back(failed);
    }
}

/// Single-flight periodic dispatcher.
pub struct Dispatcher {
    store: Arc<dyn QueueStore>,
    sender: Arc<dyn WebhookSender>,
    breaker: Arc<CircuitBreaker>,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
    config: DispatchConfig,
    stats: Arc<DispatchStats>,
    in_flight: AtomicBool,
}

impl Dispatcher {
    /// Creates a dispatcher over the given pipeline components.
    pub fn new(
        store: Arc<dyn QueueStore>,
        sender: Arc<dyn WebhookSender>,
        breaker: Arc<CircuitBreaker>,
        backoff: BackoffPolicy,
        clock: Arc<dyn Clock>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            sender,
            breaker,
            backoff,
            clock,
            config,
            stats: Arc::new(DispatchStats::new()),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Shared handle to the dispatch counters.
    pub fn stats(&self) -> Arc<DispatchStats> {
        self.stats.clone()
    }

    /// Runs the poll loop until cancellation.
    ///
    /// Each tick runs at most one cycle; a cycle that outlasts the interval
    /// causes following ticks to no-op rather than stack up.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "dispatcher started"
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    tracing::info!("dispatcher shutting down");
                    break;
                }
                () = self.clock.sleep(self.config.poll_interval) => {
                    self.run_cycle().await;
                }
            }
        }

        // Let an in-flight cycle finish before reporting shutdown complete.
        while self.in_flight.load(Ordering::Acquire) {
            tokio::task::yield_now().await;
        }
        tracing::info!(
            delivered = self.stats.items_delivered(),
            exhausted = self.stats.items_exhausted(),
            "dispatcher stopped"
        );
    }

    /// Executes one dispatch cycle.
    pub async fn run_cycle(&self) -> CycleOutcome {
        if self.in_flight.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err()
        {
            self.stats.cycles_overlapped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("dispatch tick overlapped an in-flight cycle, skipping");
            return CycleOutcome::Overlapped;
        }

        let outcome = self.cycle_inner().await;
        self.in_flight.store(false, Ordering::Release);
        outcome
    }

    async fn cycle_inner(&self) -> CycleOutcome {
        if !self.breaker.allow_cycle().await {
            self.stats.cycles_blocked.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("cycle blocked, circuit open");
            return CycleOutcome::Blocked;
        }

        self.stats.cycles_run.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now_utc();

        let batch = match self.store.claim_batch(self.config.batch_size, now).await {
            Ok(batch) => batch,
            Err(e) => {
                self.stats.claim_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "failed to claim batch, aborting cycle");
                self.breaker.record_failure().await;
                self.stats.record_cycle_outcome(true).await;
                return CycleOutcome::Aborted;
            },
        };

        if batch.is_empty() {
            return CycleOutcome::Idle;
        }

        let total = batch.len();
        tracing::debug!(claimed = total, "dispatch cycle claimed batch");

        let mut tasks = JoinSet::new();
        for item in batch {
            let sender = self.sender.clone();
            tasks.spawn(async move {
                let result = sender.attempt(&item).await;
                (item, result)
            });
        }

        let mut delivered = 0usize;
        let mut retried = 0usize;
        let mut exhausted = 0usize;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((item, Ok(()))) => {
                    delivered += 1;
                    self.finish_delivered(&item).await;
                },
                Ok((item, Err(error))) => {
                    if self.finish_failed(&item, &error, now).await {
                        retried += 1;
                    } else {
                        exhausted += 1;
                    }
                },
                Err(join_error) => {
                    // The item stays in `processing`; operators recover it
                    // by requeueing stuck rows.
                    tracing::error!(error = %join_error, "delivery task panicked");
                    exhausted += 1;
                },
            }
        }

        let failures = total - delivered;

        // Failure is recorded before success so a cycle that both trips the
        // breaker and carries a success cannot cancel the trip: success
        // while open is a no-op.
        if failures * 2 > total {
            self.breaker.record_failure().await;
        }
        if delivered > 0 {
            self.breaker.record_success().await;
        }

        self.stats.items_delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        self.stats.items_retried.fetch_add(retried as u64, Ordering::Relaxed);
        self.stats.items_exhausted.fetch_add(exhausted as u64, Ordering::Relaxed);
        self.stats.record_cycle_outcome(failures * 2 > total).await;

        tracing::info!(total, delivered, retried, exhausted, "dispatch cycle completed");
        CycleOutcome::Completed { delivered, retried, exhausted }
    }

    async fn finish_delivered(&self, item: &QueueItem) {
        if let Err(e) = self.store.mark_completed(item.id).await {
            tracing::error!(
                delivery_id = %item.id,
                error = %e,
                "delivered but failed to mark completed"
            );
        }
    }

    /// Records a failed attempt; returns true when a retry was scheduled.
    async fn finish_failed(&self, item: &QueueItem, error: &OutboxError, now: chrono::DateTime<chrono::Utc>) -> bool {
        let classification = Classification::of(error);
        let attempts = item.attempts.saturating_add(1);
        let summary = classification.summarize(error);
        let will_retry = classification.retriable && attempts < item.max_attempts;

        let next_retry_at = if will_retry {
            Some(self.backoff.next_retry_at(now, attempts, &classification))
        } else {
            None
        };

        if will_retry {
            tracing::warn!(
                delivery_id = %item.id,
                correlation_id = %item.correlation_id,
                kind = %classification.kind,
                attempts,
                max_attempts = item.max_attempts,
                next_retry_at = ?next_retry_at,
                "delivery failed, retry scheduled"
            );
        } else {
            tracing::error!(
                delivery_id = %item.id,
                correlation_id = %item.correlation_id,
                kind = %classification.kind,
                retriable = classification.retriable,
                attempts,
                "delivery failed permanently"
            );
        }

        if let Err(e) = self.store.mark_failed(item.id, attempts, summary, next_retry_at).await {
            tracing::error!(delivery_id = %item.id, error = %e, "failed to record attempt");
        }

        will_retry
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use dagang_core::{
        models::{ItemStatus, NewQueueItem},
        time::TestClock,
    };

    use super::*;
    use crate::{
        circuit::{BreakerConfig, CircuitState},
        sender::mock::FakeSender,
        store::mock::MockQueueStore,
    };

    struct Fixture {
        store: Arc<MockQueueStore>,
        sender: Arc<FakeSender>,
        breaker: Arc<CircuitBreaker>,
        clock: TestClock,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let clock = TestClock::new();
        let store = Arc::new(MockQueueStore::new());
        let sender = Arc::new(FakeSender::new());
        let breaker =
            Arc::new(CircuitBreaker::new(BreakerConfig::default(), Arc::new(clock.clone())));
        let dispatcher = Dispatcher::new(
            store.clone(),
            sender.clone(),
            breaker.clone(),
            BackoffPolicy { jitter_factor: 0.0, ..BackoffPolicy::default() },
            Arc::new(clock.clone()),
            DispatchConfig::default(),
        );
        Fixture { store, sender, breaker, clock, dispatcher }
    }

    fn new_item(max_attempts: u32) -> NewQueueItem {
        NewQueueItem {
            correlation_id: "order-1".to_string(),
            target_url: "https://example.com/hook".to_string(),
            payload: Bytes::from_static(b"{\"ok\":true}"),
            max_attempts,
        }
    }

    #[tokio::test]
    async fn empty_queue_cycle_is_idle() {
        let f = fixture();
        assert_eq!(f.dispatcher.run_cycle().await, CycleOutcome::Idle);
        assert_eq!(f.sender.attempt_count().await, 0);
        assert_eq!(f.breaker.snapshot().await.failure_count, 0);
    }

    #[tokio::test]
    async fn successful_delivery_completes_item() {
        let f = fixture();
        let id = f.store.enqueue(new_item(5)).await.unwrap();

        let outcome = f.dispatcher.run_cycle().await;
        assert_eq!(outcome, CycleOutcome::Completed { delivered: 1, retried: 0, exhausted: 0 });

        let item = f.store.find(id).await.unwrap();
        assert_eq!(item.status, ItemStatus::Completed);
        assert!(item.next_retry_at.is_none());
        assert_eq!(f.dispatcher.stats().items_delivered(), 1);
    }

    #[tokio::test]
    async fn retriable_failure_schedules_retry_with_backoff() {
        let f = fixture();
        let id = f.store.enqueue(new_item(5)).await.unwrap();
        f.sender.push_failure(OutboxError::http_status(503, "Service Unavailable")).await;

        let outcome = f.dispatcher.run_cycle().await;
        assert_eq!(outcome, CycleOutcome::Completed { delivered: 0, retried: 1, exhausted: 0 });

        let item = f.store.find(id).await.unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.attempts, 1);
        let retry_at = item.next_retry_at.expect("retry scheduled");
        // 503 is server kind: 1s * 2^0 * 2.5 with zero jitter.
        let delay = retry_at.signed_duration_since(f.clock.now_utc());
        assert_eq!(delay.num_milliseconds(), 2_500);
        assert!(item.last_error.unwrap().starts_with("server: "));
    }

    #[tokio::test]
    async fn non_retriable_failure_is_permanent() {
        let f = fixture();
        let id = f.store.enqueue(new_item(5)).await.unwrap();
        f.sender.push_failure(OutboxError::http_status(401, "Unauthorized")).await;

        let outcome = f.dispatcher.run_cycle().await;
        assert_eq!(outcome, CycleOutcome::Completed { delivered: 0, retried: 0, exhausted: 1 });

        let item = f.store.find(id).await.unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert!(item.next_retry_at.is_none());

        // Never claimed again.
        assert_eq!(f.dispatcher.run_cycle().await, CycleOutcome::Idle);
    }

    #[tokio::test]
    async fn exhausted_attempts_stop_retrying() {
        let f = fixture();
        let id = f.store.enqueue(new_item(2)).await.unwrap();

        f.sender.push_failure(OutboxError::timeout(Duration::from_secs(30))).await;
        f.dispatcher.run_cycle().await;
        f.clock.advance(Duration::from_secs(600));

        f.sender.push_failure(OutboxError::timeout(Duration::from_secs(30))).await;
        let outcome = f.dispatcher.run_cycle().await;
        assert_eq!(outcome, CycleOutcome::Completed { delivered: 0, retried: 0, exhausted: 1 });

        let item = f.store.find(id).await.unwrap();
        assert_eq!(item.attempts, 2);
        assert!(item.next_retry_at.is_none());
        assert_eq!(f.dispatcher.run_cycle().await, CycleOutcome::Idle);
    }

    #[tokio::test]
    async fn item_not_due_until_retry_time_passes() {
        let f = fixture();
        f.store.enqueue(new_item(5)).await.unwrap();
        f.sender.push_failure(OutboxError::network("ECONNRESET")).await;
        f.dispatcher.run_cycle().await;

        // network kind: 1s * 2.0 = 2s delay.
        f.clock.advance(Duration::from_millis(1_000));
        assert_eq!(f.dispatcher.run_cycle().await, CycleOutcome::Idle);

        f.clock.advance(Duration::from_millis(1_000));
        let outcome = f.dispatcher.run_cycle().await;
        assert_eq!(outcome, CycleOutcome::Completed { delivered: 1, retried: 0, exhausted: 0 });
    }

    #[tokio::test]
    async fn claim_error_aborts_cycle_and_signals_breaker() {
        let f = fixture();
        f.store.inject_claim_error("connection pool exhausted").await;

        assert_eq!(f.dispatcher.run_cycle().await, CycleOutcome::Aborted);
        assert_eq!(f.dispatcher.stats().claim_errors(), 1);
        assert_eq!(f.breaker.snapshot().await.failure_count, 1);
        assert_eq!(f.sender.attempt_count().await, 0);
    }

    #[tokio::test]
    async fn open_breaker_blocks_cycles_entirely() {
        let f = fixture();
        f.store.enqueue(new_item(5)).await.unwrap();

        for _ in 0..5 {
            f.breaker.record_failure().await;
        }

        assert_eq!(f.dispatcher.run_cycle().await, CycleOutcome::Blocked);
        assert_eq!(f.sender.attempt_count().await, 0);
        assert_eq!(f.dispatcher.stats().cycles_blocked(), 1);
    }

    #[tokio::test]
    async fn failure_majority_cycle_signals_breaker_failure() {
        let f = fixture();
        for _ in 0..3 {
            f.store.enqueue(new_item(5)).await.unwrap();
        }
        f.sender.push_failure(OutboxError::http_status(500, "boom")).await;
        f.sender.push_failure(OutboxError::http_status(500, "boom")).await;
        // Third item succeeds (script exhausted).

        f.dispatcher.run_cycle().await;

        // Failure recorded, then the success decrements it back.
        let snap = f.breaker.snapshot().await;
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 0);
        assert!(snap.last_failure_at.is_some());
    }

    #[tokio::test]
    async fn repeated_bad_cycles_open_breaker_then_block() {
        let f = fixture();

        for _ in 0..5 {
            f.store.enqueue(new_item(10)).await.unwrap();
            f.sender.push_failure(OutboxError::timeout(Duration::from_secs(30))).await;
            let outcome = f.dispatcher.run_cycle().await;
            assert!(matches!(outcome, CycleOutcome::Completed { .. }));
            f.clock.advance(Duration::from_secs(600));
        }

        assert_eq!(f.breaker.snapshot().await.state, CircuitState::Open);
        assert_eq!(f.dispatcher.run_cycle().await, CycleOutcome::Blocked);
    }

    #[tokio::test]
    async fn fifo_claim_order_is_preserved() {
        let f = fixture();
        let first = f.store.enqueue(new_item(5)).await.unwrap();
        let second = f.store.enqueue(new_item(5)).await.unwrap();
        let third = f.store.enqueue(new_item(5)).await.unwrap();

        f.dispatcher.run_cycle().await;

        let all = f.store.all().await;
        assert!(all.iter().all(|i| i.status == ItemStatus::Completed));
        // Claim order follows creation order even though attempts fan out.
        let claimed: Vec<_> = f.sender.attempted().await;
        assert_eq!(claimed.len(), 3);
        for id in [first, second, third] {
            assert!(claimed.contains(&id));
        }
    }

    #[tokio::test]
    async fn stats_window_tracks_failure_ratio() {
        let f = fixture();
        let stats = f.dispatcher.stats();
        assert!((stats.recent_failure_ratio().await - 0.0).abs() < f64::EPSILON);

        f.store.enqueue(new_item(5)).await.unwrap();
        f.sender.push_failure(OutboxError::http_status(500, "boom")).await;
        f.dispatcher.run_cycle().await;

        assert!((stats.recent_failure_ratio().await - 1.0).abs() < f64::EPSILON);

        f.clock.advance(Duration::from_secs(600));
        f.dispatcher.run_cycle().await;
        assert!((stats.recent_failure_ratio().await - 0.5).abs() < f64::EPSILON);
    }

}
