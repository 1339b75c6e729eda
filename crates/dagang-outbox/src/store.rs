//! Storage abstraction for the delivery queue.
//!
//! The dispatcher consumes queue persistence through the [`QueueStore`]
//! trait so delivery logic, retry policies, and breaker behavior are
//! testable without a database. Production uses PostgreSQL with a
//! `FOR UPDATE SKIP LOCKED` claim so concurrent dispatcher replicas can
//! never double-claim an item; tests use the in-memory [`mock`] store.

use std::{collections::HashMap, future::Future, pin::Pin};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dagang_core::{
    error::{CoreError, Result},
    models::{DeliveryId, ItemStatus, NewQueueItem, QueueItem},
};
use sqlx::{postgres::PgRow, PgPool, Row};

/// Queue persistence operations required by the delivery subsystem.
pub trait QueueStore: Send + Sync + 'static {
    /// Inserts a new delivery obligation and returns its assigned id.
    ///
    /// The store assigns id, timestamps, and the initial `pending` status;
    /// producers never choose them.
    fn enqueue(
        &self,
        item: NewQueueItem,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryId>> + Send + '_>>;

    /// Atomically claims up to `limit` due items, oldest first.
    ///
    /// An item is due when it is `pending`, or `failed` with attempts
    /// remaining and `next_retry_at <= now`. Claimed items transition to
    /// `processing` in the same statement (test-and-set, never
    /// read-then-write), which excludes rows already held by another
    /// dispatcher.
    fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<QueueItem>>> + Send + '_>>;

    /// Marks an item delivered. Terminal; clears any retry schedule.
    fn mark_completed(
        &self,
        id: DeliveryId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Records a failed attempt.
    ///
    /// With `next_retry_at` set the item becomes claim-eligible again once
    /// the timestamp passes; with `None` the failure is permanent.
    fn mark_failed(
        &self,
        id: DeliveryId,
        attempts: u32,
        error: String,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Item counts per status, for backlog monitoring.
    fn count_by_status(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<HashMap<ItemStatus, u64>>> + Send + '_>>;

    /// Items still owed a delivery: pending plus retry-scheduled failures.
    ///
    /// Permanently failed items (`next_retry_at` cleared) are terminal and
    /// excluded.
    fn count_backlog(&self) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>>;
}

/// Production queue store backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresQueueStore {
    pool: PgPool,
}

impl PostgresQueueStore {
    /// Creates a store over an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn parse_item(row: &PgRow) -> Result<QueueItem> {
        let status_text: String = row
            .try_get("status")
            .map_err(|e| CoreError::Database(format!("failed to get status: {e}")))?;
        let status: ItemStatus = status_text.parse().map_err(CoreError::Database)?;

        let attempts: i32 = row
            .try_get("attempts")
            .map_err(|e| CoreError::Database(format!("failed to get attempts: {e}")))?;
        let max_attempts: i32 = row
            .try_get("max_attempts")
            .map_err(|e| CoreError::Database(format!("failed to get max_attempts: {e}")))?;

        Ok(QueueItem {
            id: row
                .try_get("id")
                .map_err(|e| CoreError::Database(format!("failed to get id: {e}")))?,
            correlation_id: row
                .try_get("correlation_id")
                .map_err(|e| CoreError::Database(format!("failed to get correlation_id: {e}")))?,
            target_url: row
                .try_get("target_url")
                .map_err(|e| CoreError::Database(format!("failed to get target_url: {e}")))?,
            payload: Bytes::from(
                row.try_get::<Vec<u8>, _>("payload")
                    .map_err(|e| CoreError::Database(format!("failed to get payload: {e}")))?,
            ),
            status,
            attempts: u32::try_from(attempts).unwrap_or(0),
            max_attempts: u32::try_from(max_attempts).unwrap_or(0),
            next_retry_at: row
                .try_get("next_retry_at")
                .map_err(|e| CoreError::Database(format!("failed to get next_retry_at: {e}")))?,
            last_error: row
                .try_get("last_error")
                .map_err(|e| CoreError::Database(format!("failed to get last_error: {e}")))?,
            created_at: row
                .try_get("created_at")
                .map_err(|e| CoreError::Database(format!("failed to get created_at: {e}")))?,
            updated_at: row
                .try_get("updated_at")
                .map_err(|e| CoreError::Database(format!("failed to get updated_at: {e}")))?,
        })
    }
}

impl QueueStore for PostgresQueueStore {
    fn enqueue(
        &self,
        item: NewQueueItem,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryId>> + Send + '_>> {
        Box::pin(async move {
            let id = DeliveryId::new();
            sqlx::query(
                r"
                INSERT INTO outbound_webhooks (
                    id, correlation_id, target_url, payload, status,
                    attempts, max_attempts, created_at, updated_at
                ) VALUES ($1, $2, $3, $4, 'pending', 0, $5, NOW(), NOW())
                ",
            )
            .bind(id)
            .bind(&item.correlation_id)
            .bind(&item.target_url)
            .bind(item.payload.as_ref())
            .bind(i32::try_from(item.max_attempts).unwrap_or(i32::MAX))
            .execute(&self.pool)
            .await?;

            Ok(id)
        })
    }

    fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<QueueItem>>> + Send + '_>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                UPDATE outbound_webhooks
                SET status = 'processing', updated_at = $1
                WHERE id IN (
                    SELECT id FROM outbound_webhooks
                    WHERE status = 'pending'
                       OR (status = 'failed'
                           AND attempts < max_attempts
                           AND next_retry_at IS NOT NULL
                           AND next_retry_at <= $1)
                    ORDER BY created_at ASC
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING id, correlation_id, target_url, payload, status,
                    attempts, max_attempts, next_retry_at, last_error,
                    created_at, updated_at
                ",
            )
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

            rows.iter().map(Self::parse_item).collect()
        })
    }

    fn mark_completed(
        &self,
        id: DeliveryId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query(
                r"
                UPDATE outbound_webhooks
                SET status = 'completed', next_retry_at = NULL, updated_at = NOW()
                WHERE id = $1
                ",
            )
            .bind(id)
            .execute(&self.pool)
            .await?;

            Ok(())
        })
    }

    fn mark_failed(
        &self,
        id: DeliveryId,
        attempts: u32,
        error: String,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query(
                r"
                UPDATE outbound_webhooks
                SET status = 'failed', attempts = $2, last_error = $3,
                    next_retry_at = $4, updated_at = NOW()
                WHERE id = $1
                ",
            )
            .bind(id)
            .bind(i32::try_from(attempts).unwrap_or(i32::MAX))
            .bind(error)
            .bind(next_retry_at)
            .execute(&self.pool)
            .await?;

            Ok(())
        })
    }

    fn count_by_status(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<HashMap<ItemStatus, u64>>> + Send + '_>> {
        Box::pin(async move {
            let rows =
                sqlx::query("SELECT status, COUNT(*) AS n FROM outbound_webhooks GROUP BY status")
                    .fetch_all(&self.pool)
                    .await?;

            let mut counts = HashMap::new();
            for row in rows {
                let status_text: String = row
                    .try_get("status")
                    .map_err(|e| CoreError::Database(format!("failed to get status: {e}")))?;
                let status: ItemStatus = status_text.parse().map_err(CoreError::Database)?;
                let n: i64 = row
                    .try_get("n")
                    .map_err(|e| CoreError::Database(format!("failed to get count: {e}")))?;
                counts.insert(status, u64::try_from(n).unwrap_or(0));
            }

            Ok(counts)
        })
    }

    fn count_backlog(&self) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT COUNT(*) AS n FROM outbound_webhooks
                WHERE status = 'pending'
                   OR (status = 'failed' AND next_retry_at IS NOT NULL)
                ",
            )
            .fetch_one(&self.pool)
            .await?;

            let n: i64 = row
                .try_get("n")
                .map_err(|e| CoreError::Database(format!("failed to get count: {e}")))?;
            Ok(u64::try_from(n).unwrap_or(0))
        })
    }
}

pub mod mock {
    //! In-memory queue store for deterministic tests.
    //!
    //! Preserves the claim semantics of the Postgres store (due-item
    //! predicate, FIFO ordering, atomic status transition) and supports
    //! injecting a selection failure to exercise the dispatcher's abort
    //! path.

    use std::{
        collections::HashMap,
        future::Future,
        pin::Pin,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
    };

    use chrono::{DateTime, TimeZone, Utc};
    use dagang_core::{
        error::{CoreError, Result},
        models::{DeliveryId, ItemStatus, NewQueueItem, QueueItem},
    };
    use tokio::sync::RwLock;

    use super::QueueStore;

    /// In-memory store with FIFO claim ordering and failure injection.
    pub struct MockQueueStore {
        items: Arc<RwLock<Vec<QueueItem>>>,
        claim_error: Arc<RwLock<Option<String>>>,
        sequence: AtomicU64,
    }

    impl MockQueueStore {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self {
                items: Arc::new(RwLock::new(Vec::new())),
                claim_error: Arc::new(RwLock::new(None)),
                sequence: AtomicU64::new(0),
            }
        }

        /// Injects an error for the next `claim_batch` call.
        pub async fn inject_claim_error(&self, error: impl Into<String>) {
            *self.claim_error.write().await = Some(error.into());
        }

        /// Returns a copy of an item for verification.
        pub async fn find(&self, id: DeliveryId) -> Option<QueueItem> {
            self.items.read().await.iter().find(|i| i.id == id).cloned()
        }

        /// Returns copies of all items.
        pub async fn all(&self) -> Vec<QueueItem> {
            self.items.read().await.clone()
        }

        fn is_due(item: &QueueItem, now: DateTime<Utc>) -> bool {
            match item.status {
                ItemStatus::Pending => true,
                ItemStatus::Failed => {
                    item.attempts < item.max_attempts
                        && item.next_retry_at.is_some_and(|at| at <= now)
                },
                ItemStatus::Processing | ItemStatus::Completed => false,
            }
        }
    }

    impl Default for MockQueueStore {
        fn default() -> Self {
            Self::new()
        }
    }

    impl QueueStore for MockQueueStore {
        fn enqueue(
            &self,
            item: NewQueueItem,
        ) -> Pin<Box<dyn Future<Output = Result<DeliveryId>> + Send + '_>> {
            // Synthetic monotonic timestamps keep FIFO order deterministic
            // even when tests enqueue faster than clock resolution.
            let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
            let items = self.items.clone();

            Box::pin(async move {
                let id = DeliveryId::new();
                let created_at = Utc
                    .timestamp_opt(1_700_000_000 + i64::try_from(seq).unwrap_or(0), 0)
                    .single()
                    .unwrap_or_else(Utc::now);

                items.write().await.push(QueueItem {
                    id,
                    correlation_id: item.correlation_id,
                    target_url: item.target_url,
                    payload: item.payload,
                    status: ItemStatus::Pending,
                    attempts: 0,
                    max_attempts: item.max_attempts,
                    next_retry_at: None,
                    last_error: None,
                    created_at,
                    updated_at: created_at,
                });

                Ok(id)
            })
        }

        fn claim_batch(
            &self,
            limit: usize,
            now: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<QueueItem>>> + Send + '_>> {
            let items = self.items.clone();
            let claim_error = self.claim_error.clone();

            Box::pin(async move {
                if let Some(error) = claim_error.write().await.take() {
                    return Err(CoreError::Database(error));
                }

                let mut guard = items.write().await;
                let mut due: Vec<usize> = guard
                    .iter()
                    .enumerate()
                    .filter(|(_, item)| Self::is_due(item, now))
                    .map(|(idx, _)| idx)
                    .collect();
                due.sort_by_key(|&idx| guard[idx].created_at);
                due.truncate(limit);

                let mut claimed = Vec::with_capacity(due.len());
                for idx in due {
                    guard[idx].status = ItemStatus::Processing;
                    guard[idx].updated_at = now;
                    claimed.push(guard[idx].clone());
                }

                Ok(claimed)
            })
        }

        fn mark_completed(
            &self,
            id: DeliveryId,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let items = self.items.clone();
            Box::pin(async move {
                if let Some(item) = items.write().await.iter_mut().find(|i| i.id == id) {
                    item.status = ItemStatus::Completed;
                    item.next_retry_at = None;
                    item.updated_at = Utc::now();
                }
                Ok(())
            })
        }

        fn mark_failed(
            &self,
            id: DeliveryId,
            attempts: u32,
            error: String,
            next_retry_at: Option<DateTime<Utc>>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let items = self.items.clone();
            Box::pin(async move {
                if let Some(item) = items.write().await.iter_mut().find(|i| i.id == id) {
                    item.status = ItemStatus::Failed;
                    item.attempts = attempts;
                    item.last_error = Some(error);
                    item.next_retry_at = next_retry_at;
                    item.updated_at = Utc::now();
                }
                Ok(())
            })
        }

        fn count_by_status(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<HashMap<ItemStatus, u64>>> + Send + '_>> {
            let items = self.items.clone();
            Box::pin(async move {
                let mut counts = HashMap::new();
                for item in items.read().await.iter() {
                    *counts.entry(item.status).or_insert(0) += 1;
                }
                Ok(counts)
            })
        }

        fn count_backlog(&self) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
            let items = self.items.clone();
            Box::pin(async move {
                let n = items
                    .read()
                    .await
                    .iter()
                    .filter(|item| match item.status {
                        ItemStatus::Pending => true,
                        ItemStatus::Failed => item.next_retry_at.is_some(),
                        ItemStatus::Processing | ItemStatus::Completed => false,
                    })
                    .count();
                Ok(n as u64)
            })
        }
    }
}
