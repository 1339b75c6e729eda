//! Failure classification for delivery errors.
//!
//! Maps a failure signal to a taxonomy entry carrying retriability and a
//! backoff multiplier. The substring table below is a behavioral contract:
//! rules are evaluated in order and the first match wins, so reclassifying
//! an error means moving it between rows, never tweaking match order.
//!
//! Typed errors from the sender classify directly off their variant; free
//! text (errors sourced from an opaque HTTP client) falls back to
//! case-insensitive substring matching.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::OutboxError;

/// Failure taxonomy for delivery errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transport-level connectivity failure.
    Network,
    /// Request timed out or was aborted.
    Timeout,
    /// Endpoint is rate limiting us.
    RateLimit,
    /// Endpoint answered 5xx.
    Server,
    /// Credentials rejected. Never retried.
    Auth,
    /// Request rejected as malformed. Never retried.
    Validation,
    /// Unrecognized failure; retried cautiously.
    Unknown,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::Server => "server",
            Self::Auth => "auth",
            Self::Validation => "validation",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Classification record for one failure signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    /// Taxonomy entry.
    pub kind: FailureKind,
    /// Whether the item stays eligible for retry.
    pub retriable: bool,
    /// Multiplier applied to the exponential backoff delay.
    pub backoff_multiplier: f64,
    /// Triage priority; mirrors the precedence row of the rule table
    /// (1 = network .. 7 = unknown).
    pub priority: u8,
}

impl Classification {
    const fn new(kind: FailureKind, retriable: bool, backoff_multiplier: f64, priority: u8) -> Self {
        Self { kind, retriable, backoff_multiplier, priority }
    }
}

/// Rule table: (kind, trigger substrings, retriable, multiplier).
/// First match wins; matching is case-insensitive.
const RULES: &[(FailureKind, &[&str], bool, f64)] = &[
    (
        FailureKind::Network,
        &["network", "econnreset", "connection reset", "enotfound", "host not found", "etimedout"],
        true,
        2.0,
    ),
    (FailureKind::Timeout, &["timeout", "aborted"], true, 1.5),
    (FailureKind::RateLimit, &["429", "rate limit", "too many requests"], true, 3.0),
    (FailureKind::Server, &["500", "502", "503", "504"], true, 2.5),
    (FailureKind::Auth, &["401", "403", "unauthorized", "forbidden"], false, 1.0),
    (FailureKind::Validation, &["400", "invalid", "malformed", "bad request"], false, 1.0),
];

/// Fallback when no rule matches.
const UNKNOWN: Classification = Classification::new(FailureKind::Unknown, true, 1.8, 7);

impl Classification {
    /// Classifies a raw textual error signal.
    pub fn from_signal(signal: &str) -> Self {
        let lowered = signal.to_lowercase();

        for (row, (kind, triggers, retriable, multiplier)) in RULES.iter().enumerate() {
            if triggers.iter().any(|t| lowered.contains(t)) {
                let priority = u8::try_from(row + 1).unwrap_or(u8::MAX);
                return Self::new(*kind, *retriable, *multiplier, priority);
            }
        }

        UNKNOWN
    }

    /// Classifies a delivery error, preferring typed variants over text.
    ///
    /// Status codes outside the rule table (e.g. 404) intentionally fall
    /// through to the text path and classify as `unknown`.
    pub fn of(error: &OutboxError) -> Self {
        match error {
            OutboxError::Network { .. } => Self::new(FailureKind::Network, true, 2.0, 1),
            OutboxError::Timeout(_) => Self::new(FailureKind::Timeout, true, 1.5, 2),
            OutboxError::HttpStatus { status: 429, .. } => {
                Self::new(FailureKind::RateLimit, true, 3.0, 3)
            },
            OutboxError::HttpStatus { status: 500 | 502 | 503 | 504, .. } => {
                Self::new(FailureKind::Server, true, 2.5, 4)
            },
            OutboxError::HttpStatus { status: 401 | 403, .. } => {
                Self::new(FailureKind::Auth, false, 1.0, 5)
            },
            OutboxError::HttpStatus { status: 400, .. } => {
                Self::new(FailureKind::Validation, false, 1.0, 6)
            },
            other => Self::from_signal(&other.raw_signal()),
        }
    }

    /// Operator-facing summary stored as the item's `last_error`.
    pub fn summarize(&self, error: &OutboxError) -> String {
        format!("{}: {}", self.kind, error)
    }
}
