//! Queue item model and strongly-typed identifiers.
//!
//! Defines the outbound webhook queue item, its status state machine, and
//! newtype ID wrappers with database serialization traits. The delivery
//! subsystem depends on these types for compile-time safety across the
//! claim/deliver/retry lifecycle.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed identifier of one webhook delivery obligation.
///
/// Wraps a UUID to prevent mixing with other ID types. Assigned by the
/// store at enqueue time and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryId(pub Uuid);

impl DeliveryId {
    /// Creates a new random delivery ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeliveryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for DeliveryId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for DeliveryId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for DeliveryId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Lifecycle status of a queue item.
///
/// `pending -> processing -> {completed | failed}`. A `Failed` item whose
/// attempts are not exhausted and whose last error was retriable becomes
/// claim-eligible again once `next_retry_at` passes; otherwise `Failed` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Awaiting its first delivery attempt.
    Pending,
    /// Claimed by a dispatcher cycle; exactly one cycle holds it.
    Processing,
    /// Delivered successfully. Terminal.
    Completed,
    /// Last attempt failed. Terminal unless a retry remains eligible.
    Failed,
}

impl ItemStatus {
    /// Database text representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown item status: {other}")),
        }
    }
}

/// One outbound webhook delivery obligation.
#[derive(Debug, Clone)]
pub struct QueueItem {
    /// Unique identifier, assigned at enqueue.
    pub id: DeliveryId,
    /// Identifier of the originating business event (e.g. a message id).
    pub correlation_id: String,
    /// Destination endpoint. Immutable once created.
    pub target_url: String,
    /// Opaque payload bytes, signed and posted verbatim.
    pub payload: Bytes,
    /// Current lifecycle status.
    pub status: ItemStatus,
    /// Delivery attempts made so far. Never exceeds `max_attempts`.
    pub attempts: u32,
    /// Attempt budget, fixed at enqueue from configuration.
    pub max_attempts: u32,
    /// When the next retry becomes eligible; cleared on success and on
    /// permanent failure.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Classified summary of the most recent failure.
    pub last_error: Option<String>,
    /// Enqueue timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    /// Whether no further transition can occur.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            ItemStatus::Completed => true,
            ItemStatus::Failed => self.next_retry_at.is_none(),
            ItemStatus::Pending | ItemStatus::Processing => false,
        }
    }
}

/// Producer-supplied fields for a new queue item.
///
/// The store assigns id, timestamps, and the initial `Pending` status.
#[derive(Debug, Clone)]
pub struct NewQueueItem {
    /// Identifier of the originating business event.
    pub correlation_id: String,
    /// Destination endpoint.
    pub target_url: String,
    /// Opaque payload bytes.
    pub payload: Bytes,
    /// Attempt budget for this item.
    pub max_attempts: u32,
}
