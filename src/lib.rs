//! Resilience primitives for fallible async operations
//!
//! This crate wraps an arbitrary fallible asynchronous operation with
//! exponential-backoff retry and circuit-breaker short-circuiting,
//! protecting callers from transient upstream failures without
//! overwhelming the dependency during sustained outages.
//!
//! # Features
//!
//! - Exponential backoff with jitter and a hard delay cap
//! - Retry conditions: built-in transient classifier or custom predicate
//! - Per-retry observer hook for caller-side logging and metrics
//! - Three-state circuit breaker (closed / open / half-open) with a
//!   single-probe recovery path
//! - Cooperative cancellation of pending retry delays
//! - Serializable configs and statistics snapshots
//!
//! # Example
//!
//! ```no_run
//! use backstop::{BackstopError, CircuitBreaker, CircuitBreakerConfig};
//!
//! # async fn demo() -> backstop::Result<()> {
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
//!
//! let response = breaker
//!     .execute(|| async {
//!         // any fallible async operation, e.g. a network call
//!         Err::<String, _>(BackstopError::timeout("upstream did not answer"))
//!     })
//!     .await?;
//! println!("{response}");
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod error;
pub mod retry;

// Re-export main types for convenience
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerEvent, CircuitBreakerEventKind,
    CircuitBreakerListener, CircuitBreakerManager, CircuitBreakerStats, CircuitState,
};
pub use error::{BackstopError, Result};
pub use retry::{
    RetryCondition, RetryExecutor, RetryObserver, RetryPolicy, RetryPolicyBuilder, RetryStats,
};
