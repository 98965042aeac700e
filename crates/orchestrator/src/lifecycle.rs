//! Lifecycle Manager
//!
//! Tracks in-flight calls and pending retries, and drives shutdown and
//! restart:
//!
//! ```ignore
//! // graceful: stop accepting, drain in-flight calls, disconnect
//! let report = orchestrator.shutdown(ShutdownMode::Graceful, None).await;
//! assert!(orchestrator.check_for_leaks().is_clean());
//! ```

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::OperationTimer;

use crate::connection::{ConnectAllReport, ConnectionManager};
use crate::error::{OrchestratorError, Result};
use crate::reliability::health::HealthMonitor;

/// Time allowed for cancelled calls to unwind after their token fires
const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Counts in-flight calls and pending retry sleeps, and owns the
/// cancellation token handed to every call.
#[derive(Debug)]
pub struct ActivityTracker {
    accepting: AtomicBool,
    in_flight: AtomicUsize,
    pending_retries: AtomicUsize,
    idle: Notify,
    token: Mutex<CancellationToken>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            accepting: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            pending_retries: AtomicUsize::new(0),
            idle: Notify::new(),
            token: Mutex::new(CancellationToken::new()),
        }
    }

    /// Register a call. Fails with `ShuttingDown` once shutdown has begun.
    pub fn begin_call(self: &Arc<Self>) -> Result<CallGuard> {
        // Increment before checking so a concurrent drain either sees this
        // call or this call sees the drain.
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = CallGuard {
            tracker: Arc::clone(self),
            token: self.current_token(),
        };

        if !self.accepting.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ShuttingDown);
        }
        Ok(guard)
    }

    /// Marks a backoff sleep until dropped
    pub fn retry_guard(self: &Arc<Self>) -> RetryGuard {
        self.pending_retries.fetch_add(1, Ordering::SeqCst);
        RetryGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn pending_retries(&self) -> usize {
        self.pending_retries.load(Ordering::SeqCst)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Accept calls again with a fresh cancellation token
    pub fn resume_accepting(&self) {
        {
            let mut token = self.token.lock();
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
        }
        self.accepting.store(true, Ordering::SeqCst);
    }

    /// Cancel every call registered under the current token
    pub fn cancel_in_flight(&self) {
        self.token.lock().cancel();
    }

    pub fn current_token(&self) -> CancellationToken {
        self.token.lock().clone()
    }

    /// Wait until no call is in flight. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        // A timeout too large for the clock means no deadline
        let deadline = Instant::now().checked_add(timeout);

        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return true;
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.in_flight() == 0;
                    }
                }
                None => notified.await,
            }
        }
    }
}

/// Registration of one in-flight call
#[derive(Debug)]
pub struct CallGuard {
    tracker: Arc<ActivityTracker>,
    token: CancellationToken,
}

impl CallGuard {
    /// Token cancelled by a forced shutdown
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if self.tracker.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

#[derive(Debug)]
pub struct RetryGuard {
    tracker: Arc<ActivityTracker>,
}

impl Drop for RetryGuard {
    fn drop(&mut self) {
        self.tracker.pending_retries.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ShutdownMode {
    /// Drain in-flight calls up to the timeout, then disconnect
    Graceful,
    /// Cancel in-flight calls immediately, then disconnect
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecyclePhase {
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub mode: ShutdownMode,
    /// The orchestrator was already stopped; nothing was done
    pub already_stopped: bool,
    pub in_flight_at_start: usize,
    /// Every in-flight call finished without being cancelled
    pub drained: bool,
    pub cancelled_calls: usize,
    /// Backends whose disconnect reported an error
    pub failed_disconnects: Vec<String>,
    pub elapsed: Duration,
}

/// Activity still alive after shutdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeakReport {
    pub periodic_task_running: bool,
    pub pending_retries: usize,
    pub in_flight_calls: usize,
    pub connected_backends: Vec<String>,
}

impl LeakReport {
    pub fn is_clean(&self) -> bool {
        !self.periodic_task_running
            && self.pending_retries == 0
            && self.in_flight_calls == 0
            && self.connected_backends.is_empty()
    }
}

/// Shutdown, restart and leak detection
#[derive(Debug)]
pub struct LifecycleManager {
    tracker: Arc<ActivityTracker>,
    connections: Arc<ConnectionManager>,
    health: Arc<HealthMonitor>,
    default_timeout: Duration,
    phase: Mutex<LifecyclePhase>,
    transition: tokio::sync::Mutex<()>,
}

impl LifecycleManager {
    pub fn new(
        tracker: Arc<ActivityTracker>,
        connections: Arc<ConnectionManager>,
        health: Arc<HealthMonitor>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            tracker,
            connections,
            health,
            default_timeout,
            phase: Mutex::new(LifecyclePhase::Running),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        *self.phase.lock()
    }

    pub async fn shutdown(&self, mode: ShutdownMode, timeout: Option<Duration>) -> ShutdownReport {
        let _transition = self.transition.lock().await;
        let started = Instant::now();

        if self.phase() == LifecyclePhase::Stopped {
            debug!("Shutdown requested while already stopped");
            return ShutdownReport {
                mode,
                already_stopped: true,
                in_flight_at_start: 0,
                drained: true,
                cancelled_calls: 0,
                failed_disconnects: Vec::new(),
                elapsed: started.elapsed(),
            };
        }

        *self.phase.lock() = LifecyclePhase::ShuttingDown;
        let mut timer = OperationTimer::new("shutdown");
        timer.add_field("mode", mode);

        self.tracker.stop_accepting();
        self.health.stop_periodic().await;

        let in_flight_at_start = self.tracker.in_flight();
        info!(mode = ?mode, in_flight = in_flight_at_start, "Shutting down orchestrator");

        let (drained, cancelled_calls) = match mode {
            ShutdownMode::Graceful => {
                self.drain(timeout.unwrap_or(self.default_timeout)).await
            }
            ShutdownMode::Forced => {
                let cancelled = self.cancel_remaining().await;
                (cancelled == 0, cancelled)
            }
        };

        let failed_disconnects = self.connections.disconnect_all().await;
        *self.phase.lock() = LifecyclePhase::Stopped;

        timer.add_field("cancelled_calls", cancelled_calls);
        timer.add_field("failed_disconnects", failed_disconnects.len());
        timer.finish();

        ShutdownReport {
            mode,
            already_stopped: false,
            in_flight_at_start,
            drained,
            cancelled_calls,
            failed_disconnects,
            elapsed: started.elapsed(),
        }
    }

    /// Drain, disconnect, reset breaker/connection/health state, then
    /// reconnect every enabled backend.
    pub async fn restart(&self) -> Result<ConnectAllReport> {
        let _transition = self.transition.lock().await;
        let timer = OperationTimer::new("restart");

        let periodic_interval = self.health.periodic_interval();
        self.tracker.stop_accepting();
        self.health.stop_periodic().await;
        self.drain(self.default_timeout).await;

        let failed = self.connections.disconnect_all().await;
        if !failed.is_empty() {
            warn!(backends = ?failed, "Disconnect failed during restart");
        }
        self.connections.reset();
        self.health.reset();

        self.tracker.resume_accepting();
        *self.phase.lock() = LifecyclePhase::Running;

        let result = self.connections.connect_all().await;
        if let Some(interval) = periodic_interval {
            self.health.start_periodic(interval)?;
        }

        timer.finish_with_result(&result);
        result
    }

    pub fn check_for_leaks(&self) -> LeakReport {
        let report = LeakReport {
            periodic_task_running: self.health.is_periodic_running(),
            pending_retries: self.tracker.pending_retries(),
            in_flight_calls: self.tracker.in_flight(),
            connected_backends: self.connections.connected_backends(),
        };
        if !report.is_clean() {
            warn!(report = ?report, "Orchestrator activity still alive");
        }
        report
    }

    /// Wait for in-flight calls; cancel whatever is left at the deadline.
    /// Returns (drained, cancelled_calls).
    async fn drain(&self, timeout: Duration) -> (bool, usize) {
        if self.tracker.wait_idle(timeout).await {
            return (true, 0);
        }
        warn!(
            in_flight = self.tracker.in_flight(),
            timeout_ms = timeout.as_millis() as u64,
            "Drain timeout exceeded, cancelling remaining calls"
        );
        (false, self.cancel_remaining().await)
    }

    async fn cancel_remaining(&self) -> usize {
        let remaining = self.tracker.in_flight();
        // Also stops reconnect loops, which are not counted as calls
        self.tracker.cancel_in_flight();
        if remaining > 0 && !self.tracker.wait_idle(CANCEL_GRACE).await {
            warn!(
                in_flight = self.tracker.in_flight(),
                "Cancelled calls did not unwind in time"
            );
        }
        remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_call_guard_counts_in_flight() {
        let tracker = Arc::new(ActivityTracker::new());
        let first = tracker.begin_call().expect("accepting");
        let second = tracker.begin_call().expect("accepting");
        assert_eq!(tracker.in_flight(), 2);

        drop(first);
        assert_eq!(tracker.in_flight(), 1);
        drop(second);
        assert!(tracker.wait_idle(Duration::from_millis(10)).await);
    }

    #[test]
    fn test_rejects_calls_after_stop() {
        let tracker = Arc::new(ActivityTracker::new());
        tracker.stop_accepting();

        assert!(matches!(
            tracker.begin_call(),
            Err(OrchestratorError::ShuttingDown)
        ));
        assert_eq!(tracker.in_flight(), 0);

        tracker.resume_accepting();
        assert!(tracker.begin_call().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle_wakes_on_last_call() {
        let tracker = Arc::new(ActivityTracker::new());
        let guard = tracker.begin_call().expect("accepting");

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(guard);
        });

        let started = Instant::now();
        assert!(tracker.wait_idle(Duration::from_secs(30)).await);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle_without_deadline() {
        let tracker = Arc::new(ActivityTracker::new());
        let guard = tracker.begin_call().expect("accepting");

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            drop(guard);
        });

        let started = Instant::now();
        assert!(tracker.wait_idle(Duration::MAX).await);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle_times_out() {
        let tracker = Arc::new(ActivityTracker::new());
        let _guard = tracker.begin_call().expect("accepting");
        assert!(!tracker.wait_idle(Duration::from_secs(5)).await);
    }

    #[test]
    fn test_cancel_and_resume_issue_fresh_token() {
        let tracker = Arc::new(ActivityTracker::new());
        let guard = tracker.begin_call().expect("accepting");

        tracker.cancel_in_flight();
        assert!(guard.token().is_cancelled());

        tracker.resume_accepting();
        let fresh = tracker.begin_call().expect("accepting");
        assert!(!fresh.token().is_cancelled());
    }

    #[test]
    fn test_retry_guard() {
        let tracker = Arc::new(ActivityTracker::new());
        let guard = tracker.retry_guard();
        assert_eq!(tracker.pending_retries(), 1);
        drop(guard);
        assert_eq!(tracker.pending_retries(), 0);
    }

    #[test]
    fn test_leak_report_clean() {
        let report = LeakReport {
            periodic_task_running: false,
            pending_retries: 0,
            in_flight_calls: 0,
            connected_backends: Vec::new(),
        };
        assert!(report.is_clean());

        let leaking = LeakReport {
            connected_backends: vec!["plex".to_string()],
            ..report
        };
        assert!(!leaking.is_clean());
    }
}
