//! Outbound webhook delivery queue.
//!
//! Implements the durable work queue that asynchronously delivers signed
//! event payloads to external endpoints with per-item retry and backoff,
//! error classification, and a circuit breaker protecting both the
//! downstream endpoint and the queue from cascading failure.
//!
//! # Architecture
//!
//! A single periodic [`Dispatcher`] drives delivery in single-flight
//! cycles. Each cycle:
//!
//! 1. **Breaker gate** - skip the cycle entirely while the circuit is open
//! 2. **Claim batch** - atomically move due items to `processing`
//! 3. **Fan out** - deliver the batch concurrently, one task per item
//! 4. **Aggregate** - feed the batch outcome back into the breaker
//!
//! Per-item failures are absorbed: they become a scheduled retry or a
//! permanent-failure record, never an error at the cycle boundary. Only a
//! failure to *select* items aborts a cycle.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod circuit;
pub mod classify;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod sender;
pub mod store;

pub use backoff::BackoffPolicy;
pub use circuit::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use classify::{Classification, FailureKind};
pub use dispatcher::{CycleOutcome, DispatchConfig, DispatchStats, Dispatcher};
pub use error::{OutboxError, Result};
pub use health::{HealthConfig, HealthReporter, HealthSnapshot, HealthStatus};
pub use sender::{HttpSender, SenderConfig, WebhookSender};
pub use store::{PostgresQueueStore, QueueStore};

/// Default maximum items claimed per dispatch cycle.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default delivery attempt budget per item.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default HTTP request timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
