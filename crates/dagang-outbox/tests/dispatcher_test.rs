//! End-to-end dispatch pipeline tests over the in-memory store.
//!
//! Exercises full item lifecycles across multiple cycles: retry ladders
//! under a deterministic clock, breaker trip and recovery, and the
//! single-flight cycle guard.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use bytes::Bytes;
use dagang_core::{
    models::{ItemStatus, NewQueueItem, QueueItem},
    time::{ClockExt, TestClock},
};
use dagang_outbox::{
    sender::mock::FakeSender, store::mock::MockQueueStore, BackoffPolicy, BreakerConfig,
    CircuitBreaker, CircuitState, CycleOutcome, DispatchConfig, Dispatcher, OutboxError,
    QueueStore, WebhookSender,
};
use tokio::sync::Notify;

struct Pipeline {
    store: Arc<MockQueueStore>,
    sender: Arc<FakeSender>,
    breaker: Arc<CircuitBreaker>,
    clock: TestClock,
    dispatcher: Arc<Dispatcher>,
}

fn pipeline() -> Pipeline {
    let clock = TestClock::new();
    let store = Arc::new(MockQueueStore::new());
    let sender = Arc::new(FakeSender::new());
    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default(), Arc::new(clock.clone())));
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        sender.clone(),
        breaker.clone(),
        BackoffPolicy { jitter_factor: 0.0, ..BackoffPolicy::default() },
        Arc::new(clock.clone()),
        DispatchConfig::default(),
    ));
    Pipeline { store, sender, breaker, clock, dispatcher }
}

fn order_webhook(max_attempts: u32) -> NewQueueItem {
    NewQueueItem {
        correlation_id: "order-42".to_string(),
        target_url: "https://shop.example.com/hooks/orders".to_string(),
        payload: Bytes::from_static(b"{\"order_id\":42}"),
        max_attempts,
    }
}

#[tokio::test]
async fn timeout_ladder_exhausts_after_max_attempts() {
    let p = pipeline();
    let id = p.store.enqueue(order_webhook(3)).await.unwrap();

    // Attempt 1: timeout, retried after 1s * 2^0 * 1.5 = 1.5s.
    p.sender.push_failure(OutboxError::timeout(Duration::from_secs(30))).await;
    let outcome = p.dispatcher.run_cycle().await;
    assert_eq!(outcome, CycleOutcome::Completed { delivered: 0, retried: 1, exhausted: 0 });

    let item = p.store.find(id).await.unwrap();
    assert_eq!(item.attempts, 1);
    let first_retry = item.next_retry_at.unwrap();
    assert_eq!(first_retry.signed_duration_since(p.clock.now_utc()).num_milliseconds(), 1_500);

    // Not due yet: a cycle now finds nothing.
    p.clock.advance(Duration::from_millis(1_400));
    assert_eq!(p.dispatcher.run_cycle().await, CycleOutcome::Idle);

    // Attempt 2: due, times out again, delay doubles to 3s.
    p.clock.advance(Duration::from_millis(100));
    p.sender.push_failure(OutboxError::timeout(Duration::from_secs(30))).await;
    p.dispatcher.run_cycle().await;

    let item = p.store.find(id).await.unwrap();
    assert_eq!(item.attempts, 2);
    assert_eq!(
        item.next_retry_at.unwrap().signed_duration_since(p.clock.now_utc()).num_milliseconds(),
        3_000
    );

    // Attempt 3: budget exhausted, failure becomes permanent.
    p.clock.advance(Duration::from_secs(3));
    p.sender.push_failure(OutboxError::timeout(Duration::from_secs(30))).await;
    let outcome = p.dispatcher.run_cycle().await;
    assert_eq!(outcome, CycleOutcome::Completed { delivered: 0, retried: 0, exhausted: 1 });

    let item = p.store.find(id).await.unwrap();
    assert_eq!(item.status, ItemStatus::Failed);
    assert_eq!(item.attempts, 3);
    assert!(item.next_retry_at.is_none());
    assert!(item.last_error.unwrap().starts_with("timeout: "));

    // Never claimed again.
    p.clock.advance(Duration::from_secs(3600));
    assert_eq!(p.dispatcher.run_cycle().await, CycleOutcome::Idle);
    assert_eq!(p.sender.attempt_count().await, 3);
}

#[tokio::test]
async fn recovery_on_a_later_attempt_completes_the_item() {
    let p = pipeline();
    let id = p.store.enqueue(order_webhook(5)).await.unwrap();

    p.sender.push_failure(OutboxError::http_status(502, "Bad Gateway")).await;
    p.dispatcher.run_cycle().await;
    p.clock.advance(Duration::from_secs(10));

    // Script exhausted: the retry succeeds.
    let outcome = p.dispatcher.run_cycle().await;
    assert_eq!(outcome, CycleOutcome::Completed { delivered: 1, retried: 0, exhausted: 0 });

    let item = p.store.find(id).await.unwrap();
    assert_eq!(item.status, ItemStatus::Completed);
    assert_eq!(item.attempts, 1);
    assert!(item.next_retry_at.is_none());
}

#[tokio::test]
async fn breaker_opens_blocks_and_recovers_through_probe() {
    let p = pipeline();

    p.store.enqueue(order_webhook(100)).await.unwrap();

    // Five consecutive failure-dominated cycles trip the breaker.
    for i in 0..5 {
        if i > 0 {
            p.clock.advance(Duration::from_secs(600));
        }
        p.sender.push_failure(OutboxError::network("ECONNRESET")).await;
        assert!(matches!(p.dispatcher.run_cycle().await, CycleOutcome::Completed { .. }));
    }
    assert_eq!(p.breaker.snapshot().await.state, CircuitState::Open);

    // While open, cycles are blocked and no claim happens: the retry-due
    // item stays failed.
    let attempts_before = p.sender.attempt_count().await;
    assert_eq!(p.dispatcher.run_cycle().await, CycleOutcome::Blocked);
    assert_eq!(p.sender.attempt_count().await, attempts_before);

    // Well past the open timeout one probe cycle runs; it succeeds and
    // closes the circuit.
    p.clock.advance(Duration::from_secs(600));
    let outcome = p.dispatcher.run_cycle().await;
    assert!(matches!(outcome, CycleOutcome::Completed { .. }));
    assert_eq!(p.breaker.snapshot().await.state, CircuitState::Closed);
}

#[tokio::test]
async fn all_failing_batch_is_one_breaker_signal_per_cycle() {
    let p = pipeline();
    for _ in 0..5 {
        p.store.enqueue(order_webhook(100)).await.unwrap();
    }

    // Five items all failing in one cycle: the breaker consumes cycle
    // outcomes, not item outcomes, so this is a single failure signal.
    for _ in 0..5 {
        p.sender.push_failure(OutboxError::http_status(503, "Service Unavailable")).await;
    }
    let outcome = p.dispatcher.run_cycle().await;
    assert_eq!(outcome, CycleOutcome::Completed { delivered: 0, retried: 5, exhausted: 0 });

    let snap = p.breaker.snapshot().await;
    assert_eq!(snap.state, CircuitState::Closed);
    assert_eq!(snap.failure_count, 1);

    // Opening takes five such cycles, not five failed items.
    for _ in 0..4 {
        p.clock.advance(Duration::from_secs(600));
        for _ in 0..5 {
            p.sender.push_failure(OutboxError::http_status(503, "Service Unavailable")).await;
        }
        assert!(matches!(p.dispatcher.run_cycle().await, CycleOutcome::Completed { .. }));
    }
    assert_eq!(p.breaker.snapshot().await.state, CircuitState::Open);
    assert_eq!(p.dispatcher.run_cycle().await, CycleOutcome::Blocked);
}

#[tokio::test]
async fn failed_probe_reopens_the_circuit() {
    let p = pipeline();
    p.store.enqueue(order_webhook(100)).await.unwrap();

    for _ in 0..5 {
        p.breaker.record_failure().await;
    }
    p.clock.advance(Duration::from_secs(30));

    p.sender.push_failure(OutboxError::http_status(500, "still down")).await;
    assert!(matches!(p.dispatcher.run_cycle().await, CycleOutcome::Completed { .. }));

    assert_eq!(p.breaker.snapshot().await.state, CircuitState::Open);
    assert_eq!(p.dispatcher.run_cycle().await, CycleOutcome::Blocked);
}

#[tokio::test]
async fn batch_is_limited_and_fifo() {
    let clock = TestClock::new();
    let store = Arc::new(MockQueueStore::new());
    let sender = Arc::new(FakeSender::new());
    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default(), Arc::new(clock.clone())));
    let dispatcher = Dispatcher::new(
        store.clone(),
        sender.clone(),
        breaker,
        BackoffPolicy::default(),
        Arc::new(clock.clone()),
        DispatchConfig { batch_size: 2, ..DispatchConfig::default() },
    );

    let first = store.enqueue(order_webhook(5)).await.unwrap();
    let second = store.enqueue(order_webhook(5)).await.unwrap();
    let third = store.enqueue(order_webhook(5)).await.unwrap();

    let outcome = dispatcher.run_cycle().await;
    assert_eq!(outcome, CycleOutcome::Completed { delivered: 2, retried: 0, exhausted: 0 });

    // Oldest two go first; the third waits for the next cycle.
    let attempted = sender.attempted().await;
    assert!(attempted.contains(&first));
    assert!(attempted.contains(&second));
    assert!(!attempted.contains(&third));

    dispatcher.run_cycle().await;
    assert!(sender.attempted().await.contains(&third));
}

/// Sender that parks every attempt until released, to hold a cycle open.
struct GatedSender {
    release: Arc<Notify>,
}

impl WebhookSender for GatedSender {
    fn attempt<'a>(
        &'a self,
        _item: &'a QueueItem,
    ) -> Pin<Box<dyn Future<Output = dagang_outbox::Result<()>> + Send + 'a>> {
        let release = self.release.clone();
        Box::pin(async move {
            release.notified().await;
            Ok(())
        })
    }
}

#[tokio::test]
async fn overlapping_tick_is_dropped_not_queued() {
    let clock = TestClock::new();
    let store = Arc::new(MockQueueStore::new());
    let release = Arc::new(Notify::new());
    let sender = Arc::new(GatedSender { release: release.clone() });
    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default(), Arc::new(clock.clone())));
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        sender,
        breaker,
        BackoffPolicy::default(),
        Arc::new(clock.clone()),
        DispatchConfig::default(),
    ));

    store.enqueue(order_webhook(5)).await.unwrap();

    let in_flight = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.run_cycle().await }
    });

    // Give the first cycle time to claim and park inside the sender.
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(dispatcher.run_cycle().await, CycleOutcome::Overlapped);
    assert_eq!(dispatcher.stats().cycles_overlapped(), 1);

    release.notify_waiters();
    let outcome = in_flight.await.unwrap();
    assert_eq!(outcome, CycleOutcome::Completed { delivered: 1, retried: 0, exhausted: 0 });
}

#[tokio::test]
async fn per_item_failures_do_not_poison_the_batch() {
    let p = pipeline();
    p.store.enqueue(order_webhook(5)).await.unwrap();
    p.store.enqueue(order_webhook(5)).await.unwrap();

    // One failure, one success in the same batch.
    p.sender.push_failure(OutboxError::http_status(400, "Bad Request")).await;
    p.sender.push_success().await;

    let outcome = p.dispatcher.run_cycle().await;
    assert_eq!(outcome, CycleOutcome::Completed { delivered: 1, retried: 0, exhausted: 1 });

    // Statuses resolved independently.
    let statuses: Vec<ItemStatus> = p.store.all().await.iter().map(|i| i.status).collect();
    assert!(statuses.contains(&ItemStatus::Completed));
    assert!(statuses.contains(&ItemStatus::Failed));
}
