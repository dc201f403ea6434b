//! Database resilience: circuit breaking and standalone retry policies.
//!
//! The transaction layer retries deadlocks on its own; these utilities sit
//! one level up, shielding callers from a database that is down or
//! degraded. A breaker trips after consecutive failures and probes
//! recovery through a half-open state; the retry handler wraps arbitrary
//! operations with a configurable backoff.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing; calls are rejected until the recovery timeout elapses.
    Open,
    /// Probing: a limited number of calls test whether the store recovered.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit waits before probing.
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
    /// Per-call timeout; expiry counts as a failure.
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
            call_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CircuitMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub timeout_requests: u64,
    pub rejected_requests: u64,
    pub state_changes: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub average_response_ms: f64,
}

impl CircuitMetrics {
    pub fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64 * 100.0
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            100.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub retry_in_secs: Option<u64>,
    pub metrics: CircuitMetrics,
}

struct CircuitInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    next_attempt_at: Option<DateTime<Utc>>,
    metrics: CircuitMetrics,
    response_times_ms: VecDeque<f64>,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                next_attempt_at: None,
                metrics: CircuitMetrics::default(),
                response_times_ms: VecDeque::with_capacity(100),
            }),
        }
    }

    /// Run `op` under the breaker.
    ///
    /// Rejected immediately while the circuit is open; a rejection carries
    /// the seconds remaining until the next probe. Per-call timeouts count
    /// as failures.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit()?;

        let started = std::time::Instant::now();
        match tokio::time::timeout(self.config.call_timeout, op()).await {
            Ok(Ok(value)) => {
                self.record_success(started.elapsed());
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_failure(false);
                Err(e)
            }
            Err(_) => {
                self.record_failure(true);
                Err(CoreError::Timeout(self.config.call_timeout))
            }
        }
    }

    fn admit(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.metrics.total_requests += 1;

        if inner.state == CircuitState::Open {
            let now = Utc::now();
            match inner.next_attempt_at {
                Some(at) if now < at => {
                    inner.metrics.rejected_requests += 1;
                    let retry_in = (at - now).num_seconds().max(0) as u64;
                    return Err(CoreError::TransientRemote(format!(
                        "circuit '{}' is open, retry in {retry_in}s",
                        self.name
                    )));
                }
                _ => self.transition(&mut inner, CircuitState::HalfOpen),
            }
        }
        Ok(())
    }

    fn record_success(&self, elapsed: Duration) {
        let mut inner = self.inner.lock();
        inner.metrics.successful_requests += 1;
        inner.metrics.last_success_at = Some(Utc::now());

        let ms = elapsed.as_secs_f64() * 1000.0;
        if inner.response_times_ms.len() >= 100 {
            inner.response_times_ms.pop_front();
        }
        inner.response_times_ms.push_back(ms);
        inner.metrics.average_response_ms =
            inner.response_times_ms.iter().sum::<f64>() / inner.response_times_ms.len() as f64;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, timed_out: bool) {
        let mut inner = self.inner.lock();
        inner.metrics.failed_requests += 1;
        if timed_out {
            inner.metrics.timeout_requests += 1;
        }
        inner.metrics.last_failure_at = Some(Utc::now());
        inner.failure_count += 1;

        match inner.state {
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open),
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                self.transition(&mut inner, CircuitState::Open);
            }
            _ => {}
        }
    }

    fn transition(&self, inner: &mut CircuitInner, to: CircuitState) {
        if inner.state == to {
            return;
        }
        debug!(
            breaker = %self.name,
            from = inner.state.as_str(),
            to = to.as_str(),
            "circuit state change"
        );
        inner.state = to;
        inner.metrics.state_changes += 1;
        match to {
            CircuitState::Open => {
                inner.next_attempt_at = Some(
                    Utc::now()
                        + chrono::Duration::from_std(self.config.recovery_timeout)
                            .unwrap_or_default(),
                );
                warn!(breaker = %self.name, "circuit opened");
            }
            CircuitState::HalfOpen => {
                inner.success_count = 0;
                info!(breaker = %self.name, "circuit half-open, probing");
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count = 0;
                inner.next_attempt_at = None;
                info!(breaker = %self.name, "circuit closed");
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn status(&self) -> CircuitStatus {
        let inner = self.inner.lock();
        let retry_in_secs = inner
            .next_attempt_at
            .map(|at| (at - Utc::now()).num_seconds().max(0) as u64);
        CircuitStatus {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            retry_in_secs,
            metrics: inner.metrics.clone(),
        }
    }

    /// Trip the circuit manually (maintenance windows).
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Open);
    }

    pub fn force_close(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed);
    }

    /// Back to a pristine closed state, metrics included.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.next_attempt_at = None;
        inner.metrics = CircuitMetrics::default();
        inner.response_times_ms.clear();
        info!(breaker = %self.name, "circuit reset");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
    ExponentialJitter,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Fraction of the computed delay added as random jitter (0..=1).
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::ExponentialJitter,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(CoreError::InvalidInput("max_attempts must be >= 1".into()));
        }
        if self.max_delay < self.base_delay {
            return Err(CoreError::InvalidInput(
                "max_delay must be >= base_delay".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(CoreError::InvalidInput(
                "jitter_factor must be between 0 and 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryMetrics {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub total_attempts: u64,
    pub retried_operations: u64,
}

/// Wraps operations with retry-on-transient-failure semantics.
///
/// Only transient kinds are retried; invalid input, persistent database
/// errors, and invariant violations surface on the first attempt.
pub struct RetryHandler {
    name: String,
    config: RetryConfig,
    metrics: Mutex<RetryMetrics>,
}

impl RetryHandler {
    pub fn new(name: &str, config: RetryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: name.to_string(),
            config,
            metrics: Mutex::new(RetryMetrics::default()),
        })
    }

    /// Delay before retry attempt `attempt` (1-based), capped at
    /// `max_delay`.
    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay.as_secs_f64();
        let raw = match self.config.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base * f64::from(attempt),
            BackoffStrategy::Exponential => base * f64::from(2u32.saturating_pow(attempt - 1)),
            BackoffStrategy::ExponentialJitter => {
                let exp = base * f64::from(2u32.saturating_pow(attempt - 1));
                exp + exp * self.config.jitter_factor * rand::thread_rng().gen::<f64>()
            }
        };
        Duration::from_secs_f64(raw.min(self.config.max_delay.as_secs_f64()))
    }

    fn should_retry(&self, error: &CoreError, attempt: u32) -> bool {
        if attempt >= self.config.max_attempts {
            return false;
        }
        matches!(
            error,
            CoreError::TransientRemote(_)
                | CoreError::TransientDatabase(_)
                | CoreError::Timeout(_)
        )
    }

    /// Run `op`, retrying transient failures per the configured policy.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.metrics.lock().total_operations += 1;

        let mut attempt = 1u32;
        loop {
            self.metrics.lock().total_attempts += 1;
            match op().await {
                Ok(value) => {
                    let mut metrics = self.metrics.lock();
                    metrics.successful_operations += 1;
                    if attempt > 1 {
                        metrics.retried_operations += 1;
                    }
                    return Ok(value);
                }
                Err(e) if self.should_retry(&e, attempt) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        handler = %self.name,
                        attempt,
                        max_attempts = self.config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.metrics.lock().failed_operations += 1;
                    return Err(e);
                }
            }
        }
    }

    pub fn metrics(&self) -> RetryMetrics {
        self.metrics.lock().clone()
    }

    pub fn reset_metrics(&self) {
        *self.metrics.lock() = RetryMetrics::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_breaker(failure_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold,
                recovery_timeout: Duration::ZERO,
                success_threshold: 2,
                call_timeout: Duration::from_secs(5),
            },
        )
    }

    async fn ok_call(breaker: &CircuitBreaker) -> Result<u32> {
        breaker.call(|| async { Ok(7) }).await
    }

    async fn failing_call(breaker: &CircuitBreaker) -> Result<u32> {
        breaker
            .call(|| async { Err(CoreError::TransientRemote("down".into())) })
            .await
    }

    #[tokio::test]
    async fn breaker_opens_after_consecutive_failures() {
        let breaker = fast_breaker(3);
        for _ in 0..3 {
            assert!(failing_call(&breaker).await.is_err());
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.status().metrics.failed_requests, 3);
    }

    #[tokio::test]
    async fn open_breaker_rejects_until_recovery_timeout() {
        let breaker = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(3600),
                ..Default::default()
            },
        );
        assert!(failing_call(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        let rejected = ok_call(&breaker).await;
        assert!(rejected.is_err());
        assert_eq!(breaker.status().metrics.rejected_requests, 1);
    }

    #[tokio::test]
    async fn breaker_recovers_through_half_open() {
        let breaker = fast_breaker(1);
        assert!(failing_call(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        // Zero recovery timeout: next call probes immediately.
        assert!(ok_call(&breaker).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(ok_call(&breaker).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = fast_breaker(1);
        assert!(failing_call(&breaker).await.is_err());
        // Probe fails: straight back to open.
        assert!(failing_call(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn call_timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 1,
                call_timeout: Duration::from_millis(10),
                ..Default::default()
            },
        );
        let result: Result<()> = breaker
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(CoreError::Timeout(_))));
        assert_eq!(breaker.status().metrics.timeout_requests, 1);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn force_and_reset_override_the_state_machine() {
        let breaker = fast_breaker(5);
        breaker.force_open();
        assert_eq!(breaker.state(), CircuitState::Open);
        breaker.force_close();
        assert_eq!(breaker.state(), CircuitState::Closed);

        assert!(failing_call(&breaker).await.is_err());
        breaker.reset();
        assert_eq!(breaker.status().metrics.total_requests, 0);
    }

    #[test]
    fn delays_follow_the_configured_strategy() {
        let handler = |strategy| {
            RetryHandler::new(
                "test",
                RetryConfig {
                    base_delay: Duration::from_millis(100),
                    max_delay: Duration::from_millis(350),
                    strategy,
                    jitter_factor: 0.5,
                    ..Default::default()
                },
            )
            .unwrap()
        };

        let fixed = handler(BackoffStrategy::Fixed);
        assert_eq!(fixed.delay_for(1), Duration::from_millis(100));
        assert_eq!(fixed.delay_for(4), Duration::from_millis(100));

        let linear = handler(BackoffStrategy::Linear);
        assert_eq!(linear.delay_for(2), Duration::from_millis(200));

        let exp = handler(BackoffStrategy::Exponential);
        assert_eq!(exp.delay_for(1), Duration::from_millis(100));
        assert_eq!(exp.delay_for(2), Duration::from_millis(200));
        // Capped at max_delay.
        assert_eq!(exp.delay_for(3), Duration::from_millis(350));

        let jittered = handler(BackoffStrategy::ExponentialJitter);
        let d = jittered.delay_for(2);
        assert!(d >= Duration::from_millis(200) && d <= Duration::from_millis(350));
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(RetryHandler::new(
            "bad",
            RetryConfig {
                max_attempts: 0,
                ..Default::default()
            }
        )
        .is_err());
        assert!(RetryHandler::new(
            "bad",
            RetryConfig {
                base_delay: Duration::from_secs(10),
                max_delay: Duration::from_secs(1),
                ..Default::default()
            }
        )
        .is_err());
        assert!(RetryHandler::new(
            "bad",
            RetryConfig {
                jitter_factor: 1.5,
                ..Default::default()
            }
        )
        .is_err());
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let handler = RetryHandler::new(
            "test",
            RetryConfig {
                max_attempts: 5,
                base_delay: Duration::from_millis(1),
                strategy: BackoffStrategy::Fixed,
                ..Default::default()
            },
        )
        .unwrap();

        let calls = AtomicU32::new(0);
        let result = handler
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(CoreError::TransientRemote("flaky".into()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let metrics = handler.metrics();
        assert_eq!(metrics.total_attempts, 3);
        assert_eq!(metrics.retried_operations, 1);
    }

    #[tokio::test]
    async fn persistent_errors_are_never_retried() {
        let handler = RetryHandler::new("test", RetryConfig::default()).unwrap();
        let calls = AtomicU32::new(0);
        let result: Result<()> = handler
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CoreError::InvalidInput("nope".into())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(handler.metrics().failed_operations, 1);
    }

    #[tokio::test]
    async fn retries_stop_at_max_attempts() {
        let handler = RetryHandler::new(
            "test",
            RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                strategy: BackoffStrategy::Fixed,
                ..Default::default()
            },
        )
        .unwrap();

        let calls = AtomicU32::new(0);
        let result: Result<()> = handler
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CoreError::TransientRemote("still down".into())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
