//! Error types for outbound webhook delivery.
//!
//! Covers network failures, HTTP error responses, store access, and
//! configuration problems. Delivery errors carry enough context for the
//! classifier to make retry decisions without re-parsing free text where a
//! typed variant exists.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, OutboxError>;

/// Error conditions in the delivery pipeline.
#[derive(Debug, Clone, Error)]
pub enum OutboxError {
    /// Transport-level connectivity failure (DNS, refused, reset).
    #[error("network error: {message}")]
    Network {
        /// Description of the transport failure.
        message: String,
    },

    /// Hard per-attempt timeout exceeded.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Endpoint answered with a non-2xx status.
    #[error("HTTP {status}: {body}")]
    HttpStatus {
        /// Response status code.
        status: u16,
        /// Truncated response body text.
        body: String,
    },

    /// Queue store operation failed.
    #[error("store error: {message}")]
    Store {
        /// Description of the store failure.
        message: String,
    },

    /// Invalid or missing configuration; raised at construction time.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// Unexpected internal error.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal failure.
        message: String,
    },
}

impl OutboxError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(after: Duration) -> Self {
        Self::Timeout(after)
    }

    /// Creates an HTTP status error from a response.
    pub fn http_status(status: u16, body: impl Into<String>) -> Self {
        Self::HttpStatus { status, body: body.into() }
    }

    /// Creates a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Raw error signal fed to the text classifier when no typed mapping
    /// applies. Mirrors what an opaque HTTP client would surface.
    pub fn raw_signal(&self) -> String {
        self.to_string()
    }
}
