//! Circuit Breaker Implementation
//!
//! One breaker per backend. Admission hands out a [`CallPermit`]; settling the
//! permit reports the outcome. All transitions happen under the breaker's
//! mutex, and every transition bumps an epoch so that outcomes of calls
//! admitted under an earlier state are ignored.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::OrchestratorError;
use crate::registry::CircuitBreakerSettings;

/// Circuit breaker errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CircuitBreakerError {
    #[error("Circuit breaker for '{backend}' is open - retry after {retry_after:?}")]
    Open {
        backend: String,
        retry_after: Duration,
    },
}

impl From<CircuitBreakerError> for OrchestratorError {
    fn from(err: CircuitBreakerError) -> Self {
        match err {
            CircuitBreakerError::Open {
                backend,
                retry_after,
            } => OrchestratorError::CircuitBreakerOpen {
                backend,
                retry_after,
            },
        }
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitBreakerState {
    /// Circuit is closed, requests flow through normally
    Closed,

    /// Circuit is open, requests are blocked
    Open,

    /// Circuit is half-open, testing if the backend has recovered
    HalfOpen,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self::Closed
    }
}

impl std::fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerState::Closed => write!(f, "closed"),
            CircuitBreakerState::Open => write!(f, "open"),
            CircuitBreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Snapshot of one breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub backend: String,
    pub current_state: CircuitBreakerState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub half_open_trials: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub blocked_requests: u64,
    pub state_transitions: u64,
}

impl CircuitBreakerStats {
    pub fn block_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.blocked_requests as f64 / self.total_requests as f64
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitBreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    opened_at_utc: Option<DateTime<Utc>>,
    half_open_trials: u32,
    epoch: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitBreakerState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            opened_at_utc: None,
            half_open_trials: 0,
            epoch: 0,
        }
    }
}

/// Per-backend circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    backend: String,
    settings: CircuitBreakerSettings,
    inner: Mutex<BreakerInner>,
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    blocked_requests: AtomicU64,
    state_transitions: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(backend: impl Into<String>, settings: CircuitBreakerSettings) -> Self {
        Self {
            backend: backend.into(),
            settings,
            inner: Mutex::new(BreakerInner::new()),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            blocked_requests: AtomicU64::new(0),
            state_transitions: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn settings(&self) -> &CircuitBreakerSettings {
        &self.settings
    }

    /// Ask for admission of one call.
    ///
    /// An open circuit whose open duration has elapsed moves to half-open
    /// here, and the caller becomes one of its trial calls.
    pub fn try_acquire(self: &Arc<Self>) -> Result<CallPermit, CircuitBreakerError> {
        let mut inner = self.inner.lock();
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        if inner.state == CircuitBreakerState::Open {
            let elapsed = inner
                .opened_at
                .map(|opened| opened.elapsed())
                .unwrap_or(Duration::MAX);
            let open_duration = self.settings.open_duration();

            if elapsed < open_duration {
                self.blocked_requests.fetch_add(1, Ordering::Relaxed);
                return Err(CircuitBreakerError::Open {
                    backend: self.backend.clone(),
                    retry_after: open_duration - elapsed,
                });
            }
            self.transition(&mut inner, CircuitBreakerState::HalfOpen);
        }

        match inner.state {
            CircuitBreakerState::Closed => Ok(CallPermit::new(self, inner.epoch, false)),
            CircuitBreakerState::HalfOpen => {
                if inner.half_open_trials >= self.settings.half_open_success_threshold {
                    self.blocked_requests.fetch_add(1, Ordering::Relaxed);
                    return Err(CircuitBreakerError::Open {
                        backend: self.backend.clone(),
                        retry_after: Duration::ZERO,
                    });
                }
                inner.half_open_trials += 1;
                Ok(CallPermit::new(self, inner.epoch, true))
            }
            CircuitBreakerState::Open => Err(CircuitBreakerError::Open {
                backend: self.backend.clone(),
                retry_after: self.settings.open_duration(),
            }),
        }
    }

    /// Run `operation` if admitted, recording its outcome
    pub async fn call<T, F, Fut>(self: &Arc<Self>, operation: F) -> crate::error::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = crate::error::Result<T>>,
    {
        let permit = self.try_acquire()?;
        let result = operation().await;
        match &result {
            Ok(_) => permit.success(),
            Err(_) => permit.failure(),
        }
        result
    }

    /// Record a success against the current state
    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        self.record(&mut inner, true);
    }

    /// Record a failure against the current state
    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        self.record(&mut inner, false);
    }

    /// Current state. An expired open period is still reported as open until
    /// the next admission attempt.
    pub fn state(&self) -> CircuitBreakerState {
        self.inner.lock().state
    }

    /// Back to closed with cleared counters; outstanding permits become stale
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let epoch = inner.epoch + 1;
        *inner = BreakerInner::new();
        inner.epoch = epoch;
        debug!(backend = %self.backend, "Circuit breaker reset");
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            backend: self.backend.clone(),
            current_state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            opened_at: inner.opened_at_utc,
            half_open_trials: inner.half_open_trials,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            blocked_requests: self.blocked_requests.load(Ordering::Relaxed),
            state_transitions: self.state_transitions.load(Ordering::Relaxed),
        }
    }

    fn settle(&self, epoch: u64, half_open_trial: bool, outcome: Option<bool>) {
        let mut inner = self.inner.lock();

        if epoch != inner.epoch {
            debug!(
                backend = %self.backend,
                permit_epoch = epoch,
                current_epoch = inner.epoch,
                "Ignoring outcome admitted under an earlier breaker state"
            );
            return;
        }

        if half_open_trial {
            inner.half_open_trials = inner.half_open_trials.saturating_sub(1);
        }

        if let Some(success) = outcome {
            self.record(&mut inner, success);
        }
    }

    fn record(&self, inner: &mut BreakerInner, success: bool) {
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }

        match (inner.state, success) {
            (CircuitBreakerState::Closed, true) => {
                inner.consecutive_failures = 0;
            }
            (CircuitBreakerState::Closed, false) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.settings.failure_threshold {
                    self.transition(inner, CircuitBreakerState::Open);
                }
            }
            (CircuitBreakerState::HalfOpen, true) => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.settings.half_open_success_threshold {
                    self.transition(inner, CircuitBreakerState::Closed);
                }
            }
            (CircuitBreakerState::HalfOpen, false) => {
                self.transition(inner, CircuitBreakerState::Open);
            }
            (CircuitBreakerState::Open, _) => {
                // Outcome reported outside any admitted call; the open timer keeps running
            }
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitBreakerState) {
        let from = inner.state;
        inner.state = to;
        inner.epoch += 1;
        inner.half_open_trials = 0;
        inner.consecutive_successes = 0;
        self.state_transitions.fetch_add(1, Ordering::Relaxed);

        match to {
            CircuitBreakerState::Open => {
                inner.opened_at = Some(Instant::now());
                inner.opened_at_utc = Some(Utc::now());
                warn!(
                    backend = %self.backend,
                    from = %from,
                    consecutive_failures = inner.consecutive_failures,
                    open_for_ms = self.settings.open_duration().as_millis() as u64,
                    "Circuit breaker opening - blocking requests"
                );
            }
            CircuitBreakerState::HalfOpen => {
                info!(backend = %self.backend, "Circuit breaker half-open - testing recovery");
            }
            CircuitBreakerState::Closed => {
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.opened_at_utc = None;
                info!(backend = %self.backend, "Circuit breaker closing - backend recovered");
            }
        }
    }
}

/// Admission ticket for one call.
///
/// Dropping an unsettled permit (for example when the call is cancelled)
/// frees its half-open trial slot without counting a success or failure.
#[derive(Debug)]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    epoch: u64,
    half_open_trial: bool,
    settled: bool,
}

impl CallPermit {
    fn new(breaker: &Arc<CircuitBreaker>, epoch: u64, half_open_trial: bool) -> Self {
        Self {
            breaker: Arc::clone(breaker),
            epoch,
            half_open_trial,
            settled: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.half_open_trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker
            .settle(self.epoch, self.half_open_trial, Some(true));
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker
            .settle(self.epoch, self.half_open_trial, Some(false));
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.settle(self.epoch, self.half_open_trial, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn breaker(failure_threshold: u32, open_secs: f64, half_open: u32) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "sonarr",
            CircuitBreakerSettings {
                failure_threshold,
                open_duration_seconds: open_secs,
                half_open_success_threshold: half_open,
            },
        ))
    }

    #[test]
    fn test_circuit_breaker_initial_state() {
        let cb = breaker(5, 30.0, 2);
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_circuit_opens_on_failures() {
        let cb = breaker(3, 30.0, 2);

        for _ in 0..2 {
            cb.try_acquire().expect("admitted").failure();
        }
        assert_eq!(cb.state(), CircuitBreakerState::Closed);

        cb.try_acquire().expect("admitted").failure();
        assert_eq!(cb.state(), CircuitBreakerState::Open);
        assert!(matches!(
            cb.try_acquire(),
            Err(CircuitBreakerError::Open { .. })
        ));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let cb = breaker(3, 30.0, 2);
        cb.on_failure();
        cb.on_failure();
        cb.on_success();
        cb.on_failure();
        cb.on_failure();
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        assert_eq!(cb.stats().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_until_duration_elapses() {
        let cb = breaker(1, 10.0, 1);
        cb.on_failure();

        tokio::time::advance(Duration::from_secs(4)).await;
        match cb.try_acquire() {
            Err(CircuitBreakerError::Open { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_secs(6));
            }
            other => panic!("expected open rejection, got {:?}", other.map(|_| ())),
        }

        tokio::time::advance(Duration::from_secs(6)).await;
        let permit = cb.try_acquire().expect("trial admitted");
        assert!(permit.is_trial());
        assert_eq!(cb.state(), CircuitBreakerState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_successes() {
        let cb = breaker(1, 1.0, 2);
        cb.on_failure();
        tokio::time::advance(Duration::from_secs(1)).await;

        let first = cb.try_acquire().expect("first trial");
        let second = cb.try_acquire().expect("second trial");
        assert!(cb.try_acquire().is_err(), "trial slots exhausted");

        first.success();
        assert_eq!(cb.state(), CircuitBreakerState::HalfOpen);
        second.success();
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        assert_eq!(cb.stats().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_and_restarts_timer() {
        let cb = breaker(1, 5.0, 2);
        cb.on_failure();
        tokio::time::advance(Duration::from_secs(5)).await;

        cb.try_acquire().expect("trial").failure();
        assert_eq!(cb.state(), CircuitBreakerState::Open);

        tokio::time::advance(Duration::from_secs(3)).await;
        match cb.try_acquire() {
            Err(CircuitBreakerError::Open { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_secs(2));
            }
            other => panic!("expected open rejection, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_frees_slot_without_counting() {
        let cb = breaker(1, 1.0, 1);
        cb.on_failure();
        tokio::time::advance(Duration::from_secs(1)).await;

        let trial = cb.try_acquire().expect("trial");
        assert!(cb.try_acquire().is_err());
        drop(trial);

        assert_eq!(cb.state(), CircuitBreakerState::HalfOpen);
        let stats = cb.stats();
        assert_eq!(stats.half_open_trials, 0);
        cb.try_acquire().expect("slot released").success();
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
    }

    #[test]
    fn test_stale_outcome_ignored_after_transition() {
        let cb = breaker(2, 30.0, 1);
        let slow = cb.try_acquire().expect("admitted while closed");

        cb.on_failure();
        cb.on_failure();
        assert_eq!(cb.state(), CircuitBreakerState::Open);

        // Late success from before the circuit opened must not close it
        slow.success();
        assert_eq!(cb.state(), CircuitBreakerState::Open);
    }

    #[tokio::test]
    async fn test_call_records_outcome() {
        let cb = breaker(1, 30.0, 1);

        let ok: crate::error::Result<u32> = cb.call(|| async { Ok(7) }).await;
        assert_eq!(ok.ok(), Some(7));

        let err: crate::error::Result<u32> = cb
            .call(|| async { Err(OrchestratorError::connection("sonarr", "refused")) })
            .await;
        assert!(err.is_err());
        assert_eq!(cb.state(), CircuitBreakerState::Open);

        let rejected: crate::error::Result<u32> = cb.call(|| async { Ok(1) }).await;
        assert!(matches!(
            rejected,
            Err(OrchestratorError::CircuitBreakerOpen { .. })
        ));
        assert_eq!(cb.stats().blocked_requests, 1);
    }

    #[test]
    fn test_reset_closes_circuit() {
        let cb = breaker(1, 30.0, 1);
        cb.on_failure();
        assert_eq!(cb.state(), CircuitBreakerState::Open);
        assert!(cb.stats().opened_at.is_some());

        cb.reset();
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        assert!(cb.stats().opened_at.is_none());
    }

    proptest! {
        #[test]
        fn prop_opens_exactly_at_threshold(threshold in 1u32..20, extra in 0u32..5) {
            let cb = breaker(threshold, 30.0, 1);
            for _ in 0..threshold - 1 {
                cb.on_failure();
            }
            prop_assert_eq!(cb.state(), CircuitBreakerState::Closed);

            for _ in 0..=extra {
                cb.on_failure();
            }
            prop_assert_eq!(cb.state(), CircuitBreakerState::Open);
        }

        #[test]
        fn prop_interleaved_success_keeps_circuit_closed(threshold in 2u32..20, rounds in 1usize..10) {
            let cb = breaker(threshold, 30.0, 1);
            for _ in 0..rounds {
                for _ in 0..threshold - 1 {
                    cb.on_failure();
                }
                cb.on_success();
            }
            prop_assert_eq!(cb.state(), CircuitBreakerState::Closed);
        }
    }
}
