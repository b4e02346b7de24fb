//! Error types for backstop operations
//!
//! This module provides the failure taxonomy shared by the retry executor
//! and the circuit breaker: category-tagged variants for structured
//! classification, plus an unknown-error wrapper that keeps the original
//! message available to the textual transient-failure classifier.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for backstop operations
pub type Result<T> = std::result::Result<T, BackstopError>;

/// Failure type surfaced by wrapped operations and by backstop itself
#[derive(Error, Debug)]
pub enum BackstopError {
    /// Network errors
    #[error("Network error: {0}")]
    Network(String),

    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    /// Service unavailable
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// HTTP failures carrying the upstream status code
    #[error("HTTP {status}: {message}")]
    Http {
        /// Upstream HTTP status code
        status: u16,
        /// Response or transport message
        message: String,
    },

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Permission denied errors
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Short-circuit failure produced by an open circuit breaker.
    ///
    /// Never produced by a wrapped operation; `retry_after` is the
    /// estimated remaining cooldown.
    #[error("Circuit open: retry allowed in {}s", .retry_after.as_secs())]
    CircuitOpen {
        /// Remaining cooldown before the next probe is admitted
        retry_after: Duration,
    },

    /// The caller's context was cancelled while a retry delay was pending
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Unclassified errors from heterogeneous sources
    #[error("Unclassified error: {0}")]
    Unknown(#[from] anyhow::Error),
}

impl BackstopError {
    /// Create a network error
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    /// Create a connection error
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a rate limit error
    pub fn rate_limit<S: Into<String>>(msg: S) -> Self {
        Self::RateLimit(msg.into())
    }

    /// Create a service unavailable error
    pub fn service_unavailable<S: Into<String>>(msg: S) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    /// Create an HTTP error from a status code
    pub fn http<S: Into<String>>(status: u16, msg: S) -> Self {
        Self::Http {
            status,
            message: msg.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a permission denied error
    pub fn permission_denied<S: Into<String>>(msg: S) -> Self {
        Self::PermissionDenied(msg.into())
    }

    /// Create a cancellation error
    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Wrap a raw error message as an unclassified failure
    pub fn unknown<S: Into<String>>(msg: S) -> Self {
        Self::Unknown(anyhow::anyhow!(msg.into()))
    }

    /// Short tag for logging and breaker events
    pub fn kind(&self) -> &'static str {
        match self {
            BackstopError::Network(_) => "network",
            BackstopError::Connection(_) => "connection",
            BackstopError::Timeout(_) => "timeout",
            BackstopError::RateLimit(_) => "rate_limit",
            BackstopError::ServiceUnavailable(_) => "service_unavailable",
            BackstopError::Http { .. } => "http",
            BackstopError::InvalidInput(_) => "invalid_input",
            BackstopError::PermissionDenied(_) => "permission_denied",
            BackstopError::CircuitOpen { .. } => "circuit_open",
            BackstopError::Cancelled(_) => "cancelled",
            BackstopError::Unknown(_) => "unknown",
        }
    }

    /// Check whether the failure looks transient and is worth retrying.
    ///
    /// This is the default retry classification: category-tagged variants
    /// are matched structurally, `Unknown` falls back to substring
    /// matching on the message. The substring rule is a weak contract kept
    /// for compatibility with failures from heterogeneous sources; prefer
    /// the typed variants (or a custom [`crate::retry::RetryCondition`])
    /// where the caller can classify precisely.
    pub fn is_transient(&self) -> bool {
        match self {
            BackstopError::Network(_)
            | BackstopError::Connection(_)
            | BackstopError::Timeout(_)
            | BackstopError::RateLimit(_)
            | BackstopError::ServiceUnavailable(_) => true,
            BackstopError::Http { status, .. } => {
                matches!(status, 429 | 500 | 502 | 503 | 504)
            }
            BackstopError::Unknown(e) => message_is_transient(&e.to_string()),
            BackstopError::InvalidInput(_)
            | BackstopError::PermissionDenied(_)
            | BackstopError::CircuitOpen { .. }
            | BackstopError::Cancelled(_) => false,
        }
    }

    /// Check whether this is the breaker's own short-circuit failure
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, BackstopError::CircuitOpen { .. })
    }

    /// Check whether this is a cancellation failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BackstopError::Cancelled(_))
    }
}

/// Substring classifier for untyped failure messages.
///
/// Matches the message against the transient markers recognized by the
/// default retry condition: network errors, rate limiting, timeouts, and
/// the retryable HTTP status codes.
fn message_is_transient(message: &str) -> bool {
    const TRANSIENT_MARKERS: &[&str] = &[
        "network",
        "rate limit",
        "timeout",
        "429",
        "500",
        "502",
        "503",
        "504",
    ];

    let message = message.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| message.contains(m))
}
