//! Core domain models for the Dagang delivery platform.
//!
//! Provides strongly-typed identifiers, the webhook queue item model, error
//! handling, and the clock abstraction shared by the delivery subsystem.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{DeliveryId, ItemStatus, NewQueueItem, QueueItem};
pub use time::{Clock, RealClock, TestClock};
