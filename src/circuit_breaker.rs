//! Circuit breaker wrapping the retry executor
//!
//! The breaker tracks consecutive failures across invocations and, once a
//! threshold is reached, fails fast for a cooldown window before letting a
//! single probe through to test recovery. Each invocation runs the wrapped
//! operation through the embedded retry policy; only the final outcome of
//! a retry sequence counts toward the breaker's bookkeeping.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::error::{BackstopError, Result};
use crate::retry::{RetryExecutor, RetryPolicy, RetryStats};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation, calls go through with retries as configured
    #[default]
    Closed,
    /// Failing fast, the wrapped operation is not invoked
    Open,
    /// Cooldown elapsed, a single probe call is in flight
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed invocations needed to open the circuit
    pub failure_threshold: u32,
    /// Cooldown before an open circuit admits a probe
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
    /// Retry policy applied to every admitted invocation
    pub retry_policy: RetryPolicy,
    /// Overall deadline for one invocation's retry sequence
    #[serde(default, with = "humantime_serde::option")]
    pub operation_timeout: Option<Duration>,
    /// Enable per-call tracing output
    pub detailed_logging: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
            operation_timeout: None,
            detailed_logging: true,
        }
    }
}

impl CircuitBreakerConfig {
    /// Configuration for dependencies that should shed load early
    pub fn sensitive() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(10),
            retry_policy: RetryPolicy::aggressive(),
            operation_timeout: Some(Duration::from_secs(10)),
            ..Default::default()
        }
    }

    /// Configuration for dependencies that are allowed to misbehave longer
    pub fn tolerant() -> Self {
        Self {
            failure_threshold: 10,
            reset_timeout: Duration::from_secs(60),
            retry_policy: RetryPolicy::background(),
            operation_timeout: None,
            detailed_logging: false,
        }
    }
}

/// Circuit breaker statistics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    /// Current state
    pub state: CircuitState,
    /// Total `execute` calls, including short-circuited ones
    pub total_calls: u64,
    /// Invocations that ended in success
    pub successful_calls: u64,
    /// Invocations that ended in failure
    pub failed_calls: u64,
    /// Calls rejected without invoking the operation
    pub short_circuited_calls: u64,
    /// Times the circuit transitioned to open
    pub circuit_open_count: u64,
    /// Most recent recorded failure
    pub last_failure: Option<DateTime<Utc>>,
    /// Most recent recorded success
    pub last_success: Option<DateTime<Utc>>,
    /// Remaining cooldown before the next probe, when open
    #[serde(default, with = "humantime_serde::option")]
    pub time_until_probe: Option<Duration>,
}

/// Circuit breaker event kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitBreakerEventKind {
    /// The breaker moved to a different state
    StateChanged,
    /// A call was rejected without invoking the operation
    ShortCircuited,
}

/// Notification delivered to [`CircuitBreakerListener`]s
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerEvent {
    /// Event kind
    pub kind: CircuitBreakerEventKind,
    /// State before the event
    pub previous_state: CircuitState,
    /// State after the event
    pub new_state: CircuitState,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// Human-readable context
    pub context: String,
}

/// Observer for breaker state changes and short-circuits.
///
/// Fire and forget: return values are ignored and listeners should
/// return promptly, they are awaited on the caller's path.
#[async_trait::async_trait]
pub trait CircuitBreakerListener: Send + Sync {
    /// Called for every breaker event
    async fn on_event(&self, event: &CircuitBreakerEvent);
}

/// Internal guarded state triple plus the stats mirror
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<DateTime<Utc>>,
    stats: CircuitBreakerStats,
}

impl BreakerState {
    fn remaining_cooldown(&self, reset_timeout: Duration) -> Duration {
        // Open without a failure timestamp cannot happen; treat the
        // cooldown as elapsed rather than blocking forever.
        let Some(failed_at) = self.last_failure else {
            return Duration::ZERO;
        };

        let elapsed_ms = (Utc::now() - failed_at).num_milliseconds().max(0) as u128;
        let cooldown_ms = reset_timeout.as_millis();
        if elapsed_ms >= cooldown_ms {
            Duration::ZERO
        } else {
            Duration::from_millis((cooldown_ms - elapsed_ms) as u64)
        }
    }

    fn transition(&mut self, new_state: CircuitState, context: &str) -> CircuitBreakerEvent {
        let previous = self.state;
        self.state = new_state;
        self.stats.state = new_state;

        CircuitBreakerEvent {
            kind: CircuitBreakerEventKind::StateChanged,
            previous_state: previous,
            new_state,
            timestamp: Utc::now(),
            context: context.to_string(),
        }
    }

    fn short_circuit_event(&self, context: String) -> CircuitBreakerEvent {
        CircuitBreakerEvent {
            kind: CircuitBreakerEventKind::ShortCircuited,
            previous_state: self.state,
            new_state: self.state,
            timestamp: Utc::now(),
            context,
        }
    }
}

/// Circuit breaker protecting one upstream dependency.
///
/// Owned by the caller that constructs it and reused across many calls;
/// construct one per protected endpoint. State bookkeeping is serialized
/// behind a lock, the wrapped operation always runs with the lock
/// released.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    executor: RetryExecutor,
    inner: Arc<RwLock<BreakerState>>,
    listeners: Arc<RwLock<Vec<Arc<dyn CircuitBreakerListener>>>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in the closed state
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let executor = RetryExecutor::new(config.retry_policy.clone());

        Self {
            config,
            executor,
            inner: Arc::new(RwLock::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                stats: CircuitBreakerStats::default(),
            })),
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// The configuration this breaker was built with
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Execute the operation through the breaker and the embedded
    /// retry policy.
    ///
    /// When the circuit is open and the cooldown has not elapsed, the
    /// call fails immediately with [`BackstopError::CircuitOpen`] and the
    /// operation is never invoked. Failures produced by the operation
    /// (exhausted or non-retryable) propagate unchanged.
    pub async fn execute<F, T, Fut>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let probe = self.admit().await?;

        if probe && self.config.detailed_logging {
            debug!("circuit half-open, sending probe");
        }

        let result = match self.config.operation_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, self.executor.execute(operation)).await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(BackstopError::timeout(format!(
                    "exceeded circuit breaker deadline of {deadline:?}"
                ))),
            },
            None => self.executor.execute(operation).await,
        };

        self.record(&result).await;
        result
    }

    /// Admission decision under the state lock.
    ///
    /// Returns whether the admitted call is the half-open probe, or the
    /// short-circuit failure. Exactly one caller can perform the
    /// open-to-half-open transition; anyone else observing `HalfOpen`
    /// is rejected so only a single probe is ever in flight.
    async fn admit(&self) -> Result<bool> {
        let mut events = Vec::new();

        let outcome = {
            let mut inner = self.inner.write().await;
            inner.stats.total_calls += 1;

            match inner.state {
                CircuitState::Closed => Ok(false),
                CircuitState::Open => {
                    let remaining = inner.remaining_cooldown(self.config.reset_timeout);
                    if remaining.is_zero() {
                        events.push(
                            inner.transition(CircuitState::HalfOpen, "cooldown elapsed"),
                        );
                        // Probe starts from a clean slate, even if it then
                        // fails.
                        inner.failure_count = 0;
                        Ok(true)
                    } else {
                        inner.stats.short_circuited_calls += 1;
                        events.push(inner.short_circuit_event(format!(
                            "circuit open for another {remaining:?}"
                        )));
                        Err(BackstopError::CircuitOpen {
                            retry_after: remaining,
                        })
                    }
                }
                CircuitState::HalfOpen => {
                    inner.stats.short_circuited_calls += 1;
                    events.push(
                        inner.short_circuit_event("probe already in flight".to_string()),
                    );
                    Err(BackstopError::CircuitOpen {
                        retry_after: Duration::ZERO,
                    })
                }
            }
        };

        self.emit(events).await;
        outcome
    }

    /// Fold the final outcome of an admitted invocation into the state
    async fn record<T>(&self, result: &Result<T>) {
        let mut events = Vec::new();

        {
            let mut inner = self.inner.write().await;
            match result {
                Ok(_) => {
                    inner.stats.successful_calls += 1;
                    inner.stats.last_success = Some(Utc::now());
                    inner.failure_count = 0;

                    if inner.state == CircuitState::HalfOpen {
                        events.push(inner.transition(CircuitState::Closed, "probe succeeded"));
                        info!("circuit closed after successful probe");
                    }
                }
                Err(failure) => {
                    let now = Utc::now();
                    inner.stats.failed_calls += 1;
                    inner.stats.last_failure = Some(now);
                    inner.failure_count += 1;
                    inner.last_failure = Some(now);

                    if inner.state == CircuitState::HalfOpen {
                        events.push(inner.transition(CircuitState::Open, "probe failed"));
                        inner.stats.circuit_open_count += 1;
                        warn!(kind = failure.kind(), "probe failed, circuit reopened");
                    } else if inner.state == CircuitState::Closed
                        && inner.failure_count >= self.config.failure_threshold
                    {
                        events.push(
                            inner.transition(CircuitState::Open, "failure threshold reached"),
                        );
                        inner.stats.circuit_open_count += 1;
                        error!(
                            "circuit opened after {} consecutive failures",
                            inner.failure_count
                        );
                    }
                }
            }
        }

        self.emit(events).await;
    }

    /// Current state
    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    /// Consecutive failures since the last success or reset
    pub async fn failure_count(&self) -> u32 {
        self.inner.read().await.failure_count
    }

    /// Statistics snapshot, including remaining cooldown when open
    pub async fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.read().await;
        let mut stats = inner.stats.clone();

        stats.time_until_probe = match inner.state {
            CircuitState::Open => {
                let remaining = inner.remaining_cooldown(self.config.reset_timeout);
                (!remaining.is_zero()).then_some(remaining)
            }
            _ => None,
        };

        stats
    }

    /// Statistics of the embedded retry executor
    pub async fn retry_stats(&self) -> RetryStats {
        self.executor.stats().await
    }

    /// Administrative override: close the circuit and forget failures.
    ///
    /// Never called internally; intended for manual recovery after an
    /// operator fix.
    pub async fn reset(&self) {
        let event = {
            let mut inner = self.inner.write().await;
            inner.failure_count = 0;
            inner.last_failure = None;
            inner.transition(CircuitState::Closed, "manual reset")
        };

        info!("circuit breaker reset to closed state");
        self.emit(vec![event]).await;
    }

    /// Register an event listener
    pub async fn add_listener(&self, listener: Arc<dyn CircuitBreakerListener>) {
        self.listeners.write().await.push(listener);
    }

    async fn emit(&self, events: Vec<CircuitBreakerEvent>) {
        if events.is_empty() {
            return;
        }

        let listeners = self.listeners.read().await;
        for event in &events {
            for listener in listeners.iter() {
                listener.on_event(event).await;
            }
        }
    }
}

/// Registry of named circuit breakers sharing a default configuration.
///
/// One breaker per protected endpoint; the registry itself is plain
/// owned state, callers decide its lifetime.
pub struct CircuitBreakerManager {
    breakers: Arc<RwLock<HashMap<String, Arc<CircuitBreaker>>>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerManager {
    /// Create a new manager
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::new(RwLock::new(HashMap::new())),
            default_config,
        }
    }

    /// Get or create the breaker for an endpoint
    pub async fn get_breaker(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.write().await;

        if let Some(breaker) = breakers.get(endpoint) {
            return breaker.clone();
        }

        let breaker = Arc::new(CircuitBreaker::new(self.default_config.clone()));
        breakers.insert(endpoint.to_string(), breaker.clone());

        info!("created circuit breaker for endpoint: {endpoint}");
        breaker
    }

    /// Statistics for every registered breaker
    pub async fn get_all_stats(&self) -> HashMap<String, CircuitBreakerStats> {
        let breakers = self.breakers.read().await;
        let mut stats = HashMap::with_capacity(breakers.len());

        for (endpoint, breaker) in breakers.iter() {
            stats.insert(endpoint.clone(), breaker.stats().await);
        }

        stats
    }

    /// Reset every registered breaker
    pub async fn reset_all(&self) {
        let breakers = self.breakers.read().await;

        for (endpoint, breaker) in breakers.iter() {
            breaker.reset().await;
            debug!("reset circuit breaker for endpoint: {endpoint}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicyBuilder;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::sleep;

    fn quick_policy() -> RetryPolicy {
        RetryPolicyBuilder::new()
            .max_attempts(1)
            .initial_delay(Duration::from_millis(1))
            .detailed_logging(false)
            .into_policy()
    }

    fn quick_config(failure_threshold: u32, reset_timeout: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            reset_timeout,
            retry_policy: quick_policy(),
            operation_timeout: None,
            detailed_logging: false,
        }
    }

    async fn fail_once(breaker: &CircuitBreaker, invocations: &Arc<AtomicU32>) {
        let counter = invocations.clone();
        let result: Result<()> = breaker
            .execute(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(BackstopError::service_unavailable("upstream down"))
                }
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn opens_after_threshold_and_short_circuits() {
        let invocations = Arc::new(AtomicU32::new(0));
        let breaker = CircuitBreaker::new(quick_config(3, Duration::from_secs(60)));

        for _ in 0..3 {
            fail_once(&breaker, &invocations).await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert_eq!(invocations.load(Ordering::SeqCst), 3);

        let counter = invocations.clone();
        let result: Result<()> = breaker
            .execute(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_circuit_open());
        match err {
            BackstopError::CircuitOpen { retry_after } => {
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("unexpected failure: {other}"),
        }
        // Short-circuited, the operation was never invoked.
        assert_eq!(invocations.load(Ordering::SeqCst), 3);

        let stats = breaker.stats().await;
        assert_eq!(stats.short_circuited_calls, 1);
        assert_eq!(stats.circuit_open_count, 1);
        assert!(stats.time_until_probe.is_some());
    }

    #[tokio::test]
    async fn successful_probe_closes_the_circuit() {
        let invocations = Arc::new(AtomicU32::new(0));
        let breaker = CircuitBreaker::new(quick_config(2, Duration::from_millis(50)));

        for _ in 0..2 {
            fail_once(&breaker, &invocations).await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);

        sleep(Duration::from_millis(80)).await;

        let counter = invocations.clone();
        let result = breaker
            .execute(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok("recovered")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert_eq!(breaker.failure_count().await, 0);
    }

    #[tokio::test]
    async fn failed_probe_reopens_with_fresh_count() {
        let invocations = Arc::new(AtomicU32::new(0));
        let breaker = CircuitBreaker::new(quick_config(3, Duration::from_millis(50)));

        for _ in 0..3 {
            fail_once(&breaker, &invocations).await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);

        sleep(Duration::from_millis(80)).await;

        // Probe is admitted, fails, and reopens the circuit carrying a
        // failure count of one.
        fail_once(&breaker, &invocations).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 4);
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert_eq!(breaker.failure_count().await, 1);
    }

    #[tokio::test]
    async fn reset_returns_to_closed_from_any_state() {
        let invocations = Arc::new(AtomicU32::new(0));
        let breaker = CircuitBreaker::new(quick_config(1, Duration::from_secs(60)));

        fail_once(&breaker, &invocations).await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        breaker.reset().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert_eq!(breaker.failure_count().await, 0);

        let counter = invocations.clone();
        let result = breaker
            .execute(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok("back to normal")
                }
            })
            .await;
        assert_eq!(result.unwrap(), "back to normal");
    }

    #[tokio::test]
    async fn short_circuits_do_not_count_as_failures() {
        let invocations = Arc::new(AtomicU32::new(0));
        let breaker = CircuitBreaker::new(quick_config(1, Duration::from_secs(60)));

        fail_once(&breaker, &invocations).await;
        assert_eq!(breaker.failure_count().await, 1);

        for _ in 0..3 {
            let result: Result<()> = breaker.execute(|| async { Ok(()) }).await;
            assert!(result.unwrap_err().is_circuit_open());
        }

        assert_eq!(breaker.failure_count().await, 1);
        assert_eq!(breaker.stats().await.short_circuited_calls, 3);
    }

    #[tokio::test]
    async fn half_open_admits_a_single_probe() {
        let invocations = Arc::new(AtomicU32::new(0));
        let breaker = Arc::new(CircuitBreaker::new(quick_config(
            1,
            Duration::from_millis(50),
        )));

        fail_once(&breaker, &invocations).await;
        sleep(Duration::from_millis(80)).await;

        let prober = breaker.clone();
        let probe = tokio::spawn(async move {
            prober
                .execute(|| async {
                    sleep(Duration::from_millis(200)).await;
                    Ok("probe succeeded")
                })
                .await
        });

        // Let the probe get admitted, then try a concurrent call.
        sleep(Duration::from_millis(50)).await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        let concurrent: Result<&str> = breaker.execute(|| async { Ok("nope") }).await;
        assert!(concurrent.unwrap_err().is_circuit_open());

        assert_eq!(probe.await.unwrap().unwrap(), "probe succeeded");
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn operation_timeout_counts_as_failure() {
        let config = CircuitBreakerConfig {
            operation_timeout: Some(Duration::from_millis(50)),
            ..quick_config(1, Duration::from_secs(60))
        };
        let breaker = CircuitBreaker::new(config);

        let result: Result<()> = breaker
            .execute(|| async {
                sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn manager_returns_the_same_breaker_per_endpoint() {
        let manager = CircuitBreakerManager::new(CircuitBreakerConfig::default());

        let a = manager.get_breaker("billing-api").await;
        let b = manager.get_breaker("billing-api").await;
        let c = manager.get_breaker("search-api").await;

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(manager.get_all_stats().await.len(), 2);
    }
}
