//! Circuit breaker for external dependencies
//!
//! closed → open after `failure_threshold` consecutive counted failures;
//! open → half_open on the first acquisition after `reset_timeout`;
//! half_open admits exactly one trial, which closes or re-opens the circuit.

use crate::config::CircuitBreakerSettings;
use crate::errors::ProviderError;
use crate::metrics;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
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

    fn gauge_code(&self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

/// Snapshot for health endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CircuitHealth {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    /// Seconds until an open circuit admits a trial
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Shared, thread-safe breaker. One instance per dependency.
///
/// The mutex is only held for bookkeeping, never across an await.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

/// Admission ticket from [`CircuitBreaker::try_acquire`].
///
/// Report the outcome with [`Permit::succeed`] or [`Permit::fail`]. Dropping
/// an unreported half-open trial frees the trial slot without changing state.
#[must_use = "report the call outcome through the permit"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    /// Whether this permit is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }

    /// Outcome says nothing about dependency health
    pub fn release(self) {}
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: &CircuitBreakerSettings) -> Self {
        Self::with_timeout(
            name,
            settings.failure_threshold,
            Duration::from_secs(settings.reset_timeout_secs),
        )
    }

    pub fn with_timeout(
        name: impl Into<String>,
        failure_threshold: u32,
        reset_timeout: Duration,
    ) -> Self {
        let name = name.into();
        metrics::record_circuit_state(&name, CircuitState::Closed.gauge_code());
        Self {
            name,
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Bookkeeping cannot panic mid-update, so a poisoned lock is still consistent
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admit a call or reject it without any I/O
    pub fn try_acquire(&self) -> Result<Permit<'_>, ProviderError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(self.permit(false)),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
                if elapsed >= self.reset_timeout {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.trial_in_flight = true;
                    Ok(self.permit(true))
                } else {
                    Err(self.rejection())
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(self.rejection())
                } else {
                    inner.trial_in_flight = true;
                    Ok(self.permit(true))
                }
            }
        }
    }

    /// Run `operation` under the breaker.
    ///
    /// Failures for which [`ProviderError::counts_as_failure`] is false pass
    /// through without affecting the circuit.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let permit = self.try_acquire()?;
        let result = operation().await;
        match &result {
            Ok(_) => permit.succeed(),
            Err(e) if e.counts_as_failure() => permit.fail(),
            Err(_) => permit.release(),
        }
        result
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn health(&self) -> CircuitHealth {
        let inner = self.lock();
        let retry_after_secs = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => Some(
                self.reset_timeout
                    .saturating_sub(opened_at.elapsed())
                    .as_secs_f64()
                    .ceil() as u64,
            ),
            _ => None,
        };
        CircuitHealth {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            retry_after_secs,
        }
    }

    fn permit(&self, trial: bool) -> Permit<'_> {
        Permit {
            breaker: self,
            trial,
            settled: false,
        }
    }

    fn rejection(&self) -> ProviderError {
        debug!(service = %self.name, "Circuit open, rejecting call");
        ProviderError::CircuitOpen {
            service: self.name.clone(),
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen if trial => {
                inner.trial_in_flight = false;
                inner.failure_count = 0;
                inner.opened_at = None;
                self.transition(&mut inner, CircuitState::Closed);
            }
            CircuitState::Closed => inner.failure_count = 0,
            // A call admitted before the circuit opened says nothing about recovery
            _ => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen if trial => {
                inner.trial_in_flight = false;
                inner.failure_count += 1;
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.failure_threshold {
                    inner.opened_at = Some(Instant::now());
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            _ => inner.failure_count += 1,
        }
    }

    fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
            debug!(service = %self.name, "Half-open trial abandoned, slot released");
        }
    }

    fn transition(&self, inner: &mut Inner, next: CircuitState) {
        if inner.state == next {
            return;
        }
        let previous = inner.state;
        inner.state = next;
        metrics::record_circuit_state(&self.name, next.gauge_code());
        match next {
            CircuitState::Open => warn!(
                service = %self.name,
                from = previous.as_str(),
                failures = inner.failure_count,
                reset_timeout_secs = self.reset_timeout.as_secs(),
                "Circuit opened"
            ),
            _ => info!(
                service = %self.name,
                from = previous.as_str(),
                to = next.as_str(),
                "Circuit state changed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_ok, assert_pending};

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::with_timeout("generation", 5, Duration::from_secs(60))
    }

    fn transport() -> ProviderError {
        ProviderError::Transport {
            message: "connection reset".to_string(),
        }
    }

    async fn fail_through(
        breaker: &CircuitBreaker,
        calls: &AtomicUsize,
    ) -> Result<(), ProviderError> {
        breaker
            .call(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(transport())
            })
            .await
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let breaker = breaker();
        let calls = AtomicUsize::new(0);

        for i in 1..=5 {
            assert!(fail_through(&breaker, &calls).await.is_err());
            let expected = if i < 5 { CircuitState::Closed } else { CircuitState::Open };
            assert_eq!(breaker.state(), expected);
        }

        // Rejected without invoking the provider
        let err = fail_through(&breaker, &calls).await.unwrap_err();
        assert!(matches!(err, ProviderError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(breaker.health().failure_count, 5);
        assert!(breaker.health().retry_after_secs.is_some());
    }

    #[tokio::test]
    async fn test_success_resets_count() {
        let breaker = breaker();
        let calls = AtomicUsize::new(0);
        for _ in 0..4 {
            let _ = fail_through(&breaker, &calls).await;
        }
        breaker.call(|| async { Ok::<_, ProviderError>(()) }).await.unwrap();
        assert_eq!(breaker.health().failure_count, 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_non_counting_errors_are_ignored() {
        let breaker = breaker();
        for _ in 0..10 {
            let _ = breaker
                .call(|| async {
                    Err::<(), _>(ProviderError::InvalidRequest {
                        message: "empty prompt".to_string(),
                    })
                })
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.health().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_single_trial_then_close() {
        let breaker = breaker();
        let calls = AtomicUsize::new(0);
        for _ in 0..5 {
            let _ = fail_through(&breaker, &calls).await;
        }
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(breaker.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        let trial = breaker.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Concurrent callers are rejected while the trial runs
        assert!(matches!(breaker.try_acquire(), Err(ProviderError::CircuitOpen { .. })));

        trial.succeed();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.health().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_with_fresh_timer() {
        let breaker = breaker();
        let calls = AtomicUsize::new(0);
        for _ in 0..5 {
            let _ = fail_through(&breaker, &calls).await;
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(fail_through(&breaker, &calls).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_releases_slot() {
        let breaker = breaker();
        let calls = AtomicUsize::new(0);
        for _ in 0..5 {
            let _ = fail_through(&breaker, &calls).await;
        }
        tokio::time::advance(Duration::from_secs(60)).await;

        let mut trial = tokio_test::task::spawn(breaker.call(|| async {
            futures::future::pending::<()>().await;
            Ok::<_, ProviderError>(())
        }));
        assert_pending!(trial.poll());
        assert!(breaker.try_acquire().is_err());

        drop(trial);

        let next = assert_ok!(breaker.try_acquire());
        assert!(next.is_trial());
        next.succeed();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(serde_json::to_string(&CircuitState::HalfOpen).unwrap(), "\"half_open\"");
        assert_eq!(CircuitState::Open.as_str(), "open");
    }
}
