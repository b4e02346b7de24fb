//! Retry policy and executor with exponential backoff
//!
//! This module drives repeated invocation of a fallible async operation:
//! a [`RetryPolicy`] describes the attempt budget, delay bounds, and
//! retry condition; the [`RetryExecutor`] applies it, delegating delay
//! computation to [`crate::backoff`] and surfacing the last failure once
//! the budget is exhausted.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::compute_delay;
use crate::error::{BackstopError, Result};

/// Observer invoked before each scheduled retry with
/// (1-based attempt index, failure, computed delay).
///
/// Side-effect only; the return value is never consulted.
pub type RetryObserver = Arc<dyn Fn(u32, &BackstopError, Duration) + Send + Sync>;

/// Condition deciding whether a failure is worth another attempt
#[derive(Default)]
pub enum RetryCondition {
    /// Built-in transient classifier ([`BackstopError::is_transient`])
    #[default]
    Transient,
    /// Caller-supplied predicate over the classified failure
    Custom(Arc<dyn Fn(&BackstopError) -> bool + Send + Sync>),
}

impl RetryCondition {
    /// Evaluate the condition against a failure
    pub fn should_retry(&self, failure: &BackstopError) -> bool {
        match self {
            Self::Transient => failure.is_transient(),
            Self::Custom(predicate) => predicate(failure),
        }
    }
}

impl Clone for RetryCondition {
    fn clone(&self) -> Self {
        match self {
            Self::Transient => Self::Transient,
            Self::Custom(predicate) => Self::Custom(Arc::clone(predicate)),
        }
    }
}

impl fmt::Debug for RetryCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "Transient"),
            Self::Custom(_) => write!(f, "Custom(<function>)"),
        }
    }
}

/// Retry policy configuration
///
/// Invariants: `max_attempts >= 1` (a zero value is treated as one
/// attempt), `initial_delay <= max_delay` (delays are capped at
/// `max_delay` regardless), `backoff_factor >= 1`.
#[derive(Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total invocation attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Upper bound on any single delay, before jitter
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Multiplicative delay growth per attempt
    pub backoff_factor: f64,
    /// Condition consulted after every failure
    #[serde(skip, default)]
    pub condition: RetryCondition,
    /// Observer notified before each scheduled retry
    #[serde(skip, default)]
    pub on_retry: Option<RetryObserver>,
    /// Enable per-attempt tracing output
    pub detailed_logging: bool,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_factor", &self.backoff_factor)
            .field("condition", &self.condition)
            .field("on_retry", &self.on_retry.as_ref().map(|_| "<observer>"))
            .field("detailed_logging", &self.detailed_logging)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            condition: RetryCondition::default(),
            on_retry: None,
            detailed_logging: true,
        }
    }
}

impl RetryPolicy {
    /// Policy for latency-sensitive operations (fewer attempts, shorter delays)
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            backoff_factor: 1.5,
            ..Default::default()
        }
    }

    /// Policy for background operations (more attempts, longer delays)
    pub fn background() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(120),
            backoff_factor: 3.0,
            detailed_logging: false,
            ..Default::default()
        }
    }
}

/// Retry statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryStats {
    /// Total operations attempted
    pub total_operations: u64,
    /// Operations that succeeded on the first attempt
    pub successful_first_attempt: u64,
    /// Operations that succeeded after at least one retry
    pub successful_after_retry: u64,
    /// Operations that failed with all attempts exhausted
    pub failed_after_retries: u64,
    /// Operations stopped by a non-retryable failure
    pub non_retryable_failures: u64,
    /// Total retry attempts across all operations
    pub total_retry_attempts: u64,
    /// Average retries per operation
    pub average_retries: f64,
    /// Timestamp of the most recent scheduled retry
    pub last_retry: Option<DateTime<Utc>>,
}

impl RetryStats {
    fn recompute_average(&mut self) {
        if self.total_operations > 0 {
            self.average_retries =
                self.total_retry_attempts as f64 / self.total_operations as f64;
        }
    }
}

/// Retry executor
pub struct RetryExecutor {
    policy: RetryPolicy,
    stats: Arc<RwLock<RetryStats>>,
}

impl RetryExecutor {
    /// Create a new retry executor
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            stats: Arc::new(RwLock::new(RetryStats::default())),
        }
    }

    /// The policy this executor applies
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute the operation with the configured retry policy.
    ///
    /// Returns the first success, the first non-retryable failure, or
    /// the final failure once all attempts are exhausted.
    pub async fn execute<F, T, Fut>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(operation, None).await
    }

    /// [`Self::execute`] racing every pending delay against `cancel`.
    ///
    /// When the token fires while a backoff delay is pending, the delay
    /// is aborted, remaining attempts are abandoned, and
    /// [`BackstopError::Cancelled`] is returned.
    pub async fn execute_cancellable<F, T, Fut>(
        &self,
        operation: F,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(operation, Some(cancel)).await
    }

    async fn run<F, T, Fut>(&self, operation: F, cancel: Option<&CancellationToken>) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);

        let mut stats = self.stats.write().await;
        stats.total_operations += 1;
        drop(stats);

        let mut attempt: u32 = 0;

        loop {
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    return Err(BackstopError::cancelled("retry sequence abandoned"));
                }
            }

            if self.policy.detailed_logging && attempt > 0 {
                debug!("retry attempt {} of {}", attempt + 1, max_attempts);
            }

            match operation().await {
                Ok(result) => {
                    let mut stats = self.stats.write().await;
                    if attempt == 0 {
                        stats.successful_first_attempt += 1;
                    } else {
                        stats.successful_after_retry += 1;
                    }
                    stats.recompute_average();
                    drop(stats);

                    if self.policy.detailed_logging && attempt > 0 {
                        info!("operation succeeded after {} attempts", attempt + 1);
                    }

                    return Ok(result);
                }
                Err(failure) => {
                    if !self.policy.condition.should_retry(&failure) {
                        let mut stats = self.stats.write().await;
                        stats.non_retryable_failures += 1;
                        stats.recompute_average();
                        drop(stats);

                        if self.policy.detailed_logging {
                            debug!(kind = failure.kind(), "failure not retryable: {failure}");
                        }

                        return Err(failure);
                    }

                    if attempt + 1 >= max_attempts {
                        let mut stats = self.stats.write().await;
                        stats.failed_after_retries += 1;
                        stats.recompute_average();
                        drop(stats);

                        warn!(
                            "operation failed after {} attempts: {failure}",
                            attempt + 1
                        );

                        return Err(failure);
                    }

                    let delay = compute_delay(
                        attempt,
                        self.policy.initial_delay,
                        self.policy.max_delay,
                        self.policy.backoff_factor,
                    );

                    // Observers see 1-based attempt numbers.
                    if let Some(observer) = &self.policy.on_retry {
                        observer(attempt + 1, &failure, delay);
                    }

                    let mut stats = self.stats.write().await;
                    stats.total_retry_attempts += 1;
                    stats.last_retry = Some(Utc::now());
                    drop(stats);

                    if self.policy.detailed_logging {
                        debug!(
                            "retrying after {:?} (attempt {}/{})",
                            delay,
                            attempt + 1,
                            max_attempts
                        );
                    }

                    match cancel {
                        Some(token) => {
                            tokio::select! {
                                _ = token.cancelled() => {
                                    return Err(BackstopError::cancelled(
                                        "retry delay aborted",
                                    ));
                                }
                                _ = sleep(delay) => {}
                            }
                        }
                        None => sleep(delay).await,
                    }

                    attempt += 1;
                }
            }
        }
    }

    /// Snapshot of the executor's statistics
    pub async fn stats(&self) -> RetryStats {
        self.stats.read().await.clone()
    }

    /// Reset statistics
    pub async fn reset_stats(&self) {
        *self.stats.write().await = RetryStats::default();
    }
}

/// Fluent builder for a retry executor
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicyBuilder {
    /// Start from the default policy
    pub fn new() -> Self {
        Self {
            policy: RetryPolicy::default(),
        }
    }

    /// Set total attempts, including the first
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts;
        self
    }

    /// Set the delay before the second attempt
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Set the upper bound on any single delay
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Set the multiplicative delay growth
    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.policy.backoff_factor = factor;
        self
    }

    /// Set the retry condition
    pub fn condition(mut self, condition: RetryCondition) -> Self {
        self.policy.condition = condition;
        self
    }

    /// Retry only when the predicate accepts the failure
    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&BackstopError) -> bool + Send + Sync + 'static,
    {
        self.policy.condition = RetryCondition::Custom(Arc::new(predicate));
        self
    }

    /// Install a retry observer
    pub fn on_retry<F>(mut self, observer: F) -> Self
    where
        F: Fn(u32, &BackstopError, Duration) + Send + Sync + 'static,
    {
        self.policy.on_retry = Some(Arc::new(observer));
        self
    }

    /// Enable or disable per-attempt tracing output
    pub fn detailed_logging(mut self, enabled: bool) -> Self {
        self.policy.detailed_logging = enabled;
        self
    }

    /// Finish building the policy
    pub fn into_policy(self) -> RetryPolicy {
        self.policy
    }

    /// Build a retry executor applying the policy
    pub fn build(self) -> RetryExecutor {
        RetryExecutor::new(self.policy)
    }
}
