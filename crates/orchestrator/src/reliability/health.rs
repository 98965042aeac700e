//! Backend Health Monitoring
//!
//! Probes backends through the tool router (so probes respect and feed the
//! circuit breaker, one outcome per check), tracks consecutive probe failures to flag backends as
//! down, and runs optional periodic checks as a cancellable background task.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::arena::{BackendArena, ConnectionState};
use crate::error::{OrchestratorError, Result};
use crate::registry::HealthSettings;
use crate::reliability::circuit_breaker::CircuitBreakerState;
use crate::reliability::retry_policy::{BackoffStrategy, RetryPolicy};
use crate::router::ToolRouter;
use crate::stats::StatsCollector;

/// Result of one health check
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub backend: String,
    pub healthy: bool,
    /// Consecutive failed checks reached the down threshold
    pub down: bool,
    pub latency: Option<Duration>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub breaker_state: Option<CircuitBreakerState>,
    pub connection_state: Option<ConnectionState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateHealthReport {
    pub healthy: bool,
    pub reports: BTreeMap<String, HealthReport>,
    pub timestamp: DateTime<Utc>,
}

impl AggregateHealthReport {
    pub fn unhealthy_backends(&self) -> Vec<&str> {
        self.reports
            .values()
            .filter(|report| !report.healthy)
            .map(|report| report.backend.as_str())
            .collect()
    }
}

#[derive(Debug)]
struct PeriodicTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
    interval: Duration,
}

#[derive(Debug)]
pub struct HealthMonitor {
    router: Arc<ToolRouter>,
    arena: Arc<BackendArena>,
    settings: HealthSettings,
    stats: Arc<StatsCollector>,
    consecutive_failures: DashMap<String, u32>,
    periodic: Mutex<Option<PeriodicTask>>,
}

impl HealthMonitor {
    pub fn new(
        router: Arc<ToolRouter>,
        arena: Arc<BackendArena>,
        settings: HealthSettings,
        stats: Arc<StatsCollector>,
    ) -> Self {
        Self {
            router,
            arena,
            settings,
            stats,
            consecutive_failures: DashMap::new(),
            periodic: Mutex::new(None),
        }
    }

    /// Probe one backend. Never fails: problems become an unhealthy report.
    pub async fn health_check(&self, backend: &str) -> HealthReport {
        let slot = match self.arena.resolve(backend) {
            Ok(slot) => slot,
            Err(error) => {
                return HealthReport {
                    backend: backend.to_string(),
                    healthy: false,
                    down: false,
                    latency: None,
                    message: error.to_string(),
                    timestamp: Utc::now(),
                    consecutive_failures: 0,
                    breaker_state: None,
                    connection_state: None,
                };
            }
        };
        self.stats.record_health_check();

        let started = Instant::now();
        let probe: Result<Duration> = if !slot.config().enabled {
            Err(OrchestratorError::connection(slot.name(), "backend is disabled"))
        } else if !slot.is_connected() {
            Err(OrchestratorError::connection(
                slot.name(),
                format!("backend is {}", slot.state()),
            ))
        } else {
            let policy = RetryPolicy::new(
                self.settings.probe_retries,
                BackoffStrategy::Fixed {
                    delay: Duration::from_millis(self.settings.probe_retry_delay_ms),
                },
            )
            .with_tracker(Arc::clone(self.router.tracker()));
            self.router.probe(slot.name(), &policy).await
        };

        let (healthy, message, latency) = match probe {
            Ok(latency) => (true, "ok".to_string(), Some(latency)),
            Err(error) => (false, error.to_string(), Some(started.elapsed())),
        };
        let consecutive_failures = self.record_outcome(slot.name(), healthy);

        HealthReport {
            backend: slot.name().to_string(),
            healthy,
            down: consecutive_failures >= self.settings.down_threshold.max(1),
            latency,
            message,
            timestamp: Utc::now(),
            consecutive_failures,
            breaker_state: Some(slot.breaker().state()),
            connection_state: Some(slot.state()),
        }
    }

    /// Probe every enabled backend concurrently.
    ///
    /// Overall health is the AND over required backends, or over every
    /// enabled backend when none is required.
    pub async fn health_check_all(&self) -> AggregateHealthReport {
        let enabled: Vec<_> = self.arena.enabled_slots().collect();
        let required: Vec<&str> = enabled
            .iter()
            .filter(|slot| slot.config().required)
            .map(|slot| slot.name())
            .collect();

        let reports: BTreeMap<String, HealthReport> =
            join_all(enabled.iter().map(|slot| self.health_check(slot.name())))
                .await
                .into_iter()
                .map(|report| (report.backend.clone(), report))
                .collect();

        let healthy = if required.is_empty() {
            reports.values().all(|report| report.healthy)
        } else {
            required
                .iter()
                .all(|name| reports.get(*name).map(|r| r.healthy).unwrap_or(false))
        };

        AggregateHealthReport {
            healthy,
            reports,
            timestamp: Utc::now(),
        }
    }

    /// Run `health_check_all` every `period` in the background. Replaces a
    /// task that is already running.
    pub fn start_periodic(self: &Arc<Self>, period: Duration) -> Result<()> {
        if period.is_zero() {
            return Err(OrchestratorError::validation(
                "health check interval must be greater than zero",
            ));
        }

        let mut periodic = self.periodic.lock();
        if let Some(previous) = periodic.take() {
            debug!("Replacing running periodic health checks");
            previous.token.cancel();
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_periodic(Arc::downgrade(self), period, token.clone()));
        *periodic = Some(PeriodicTask {
            token,
            handle,
            interval: period,
        });

        info!(interval_ms = period.as_millis() as u64, "Periodic health checks started");
        Ok(())
    }

    /// Cancel the periodic task and wait for it to finish
    pub async fn stop_periodic(&self) {
        let task = self.periodic.lock().take();
        if let Some(task) = task {
            task.token.cancel();
            if let Err(error) = task.handle.await {
                warn!(error = %error, "Periodic health check task ended abnormally");
            }
            info!("Periodic health checks stopped");
        }
    }

    pub fn is_periodic_running(&self) -> bool {
        self.periodic
            .lock()
            .as_ref()
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }

    pub fn periodic_interval(&self) -> Option<Duration> {
        self.periodic.lock().as_ref().map(|task| task.interval)
    }

    pub fn consecutive_failures(&self, backend: &str) -> u32 {
        self.arena
            .resolve(backend)
            .ok()
            .and_then(|slot| self.consecutive_failures.get(slot.name()).map(|v| *v))
            .unwrap_or(0)
    }

    /// Forget failure history
    pub fn reset(&self) {
        self.consecutive_failures.clear();
    }

    fn record_outcome(&self, backend: &str, healthy: bool) -> u32 {
        let threshold = self.settings.down_threshold.max(1);
        let mut failures = self
            .consecutive_failures
            .entry(backend.to_string())
            .or_insert(0);

        if healthy {
            if *failures >= threshold {
                info!(backend = %backend, "Backend recovered");
            }
            *failures = 0;
        } else {
            *failures += 1;
            if *failures == threshold {
                warn!(
                    backend = %backend,
                    consecutive_failures = *failures,
                    "Backend marked down"
                );
            } else {
                debug!(backend = %backend, consecutive_failures = *failures, "Health check failed");
            }
        }
        *failures
    }
}

async fn run_periodic(monitor: Weak<HealthMonitor>, period: Duration, token: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; checks start one period later
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(monitor) = monitor.upgrade() else {
            break;
        };

        tokio::select! {
            _ = token.cancelled() => break,
            report = monitor.health_check_all() => {
                debug!(
                    healthy = report.healthy,
                    unhealthy = ?report.unhealthy_backends(),
                    "Periodic health check completed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCapability, BackendError, SharedBackend};
    use crate::lifecycle::ActivityTracker;
    use crate::registry::{BackendConfig, BackendRegistry, RetrySettings};
    use async_trait::async_trait;
    use serde_json::{Map, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct ProbeBackend {
        healthy: AtomicBool,
        probes: AtomicU32,
    }

    #[async_trait]
    impl BackendCapability for ProbeBackend {
        async fn connect(&self) -> std::result::Result<(), BackendError> {
            Ok(())
        }

        async fn disconnect(&self) -> std::result::Result<(), BackendError> {
            Ok(())
        }

        async fn invoke(
            &self,
            _tool: &str,
            _params: &Map<String, Value>,
        ) -> std::result::Result<Value, BackendError> {
            Ok(Value::Null)
        }

        async fn is_healthy(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn monitor(backend: Arc<ProbeBackend>, settings: HealthSettings) -> Arc<HealthMonitor> {
        let registry = BackendRegistry::new(vec![
            BackendConfig::new("qbittorrent", "http://qbittorrent:8080").required(),
        ])
        .expect("valid registry");
        let mut capabilities: HashMap<String, SharedBackend> = HashMap::new();
        capabilities.insert("qbittorrent".to_string(), backend);

        let arena = Arc::new(BackendArena::new(registry, capabilities).expect("arena builds"));
        arena
            .resolve("qbittorrent")
            .expect("resolves")
            .update_status(|status| status.state = ConnectionState::Connected);

        let stats = Arc::new(StatsCollector::new());
        let router = Arc::new(ToolRouter::new(
            Arc::clone(&arena),
            RetrySettings::default(),
            Arc::new(ActivityTracker::new()),
            Arc::clone(&stats),
        ));
        Arc::new(HealthMonitor::new(router, arena, settings, stats))
    }

    fn settings(probe_retries: u32, down_threshold: u32) -> HealthSettings {
        HealthSettings {
            probe_retries,
            probe_retry_delay_ms: 1,
            down_threshold,
        }
    }

    #[tokio::test]
    async fn test_healthy_backend() {
        let backend = Arc::new(ProbeBackend {
            healthy: AtomicBool::new(true),
            probes: AtomicU32::new(0),
        });
        let monitor = monitor(Arc::clone(&backend), settings(2, 3));

        let report = monitor.health_check("qbittorrent").await;
        assert!(report.healthy);
        assert!(!report.down);
        assert_eq!(backend.probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unhealthy_probe_retried_then_reported() {
        let backend = Arc::new(ProbeBackend {
            healthy: AtomicBool::new(false),
            probes: AtomicU32::new(0),
        });
        let monitor = monitor(Arc::clone(&backend), settings(2, 3));

        let report = monitor.health_check("qbittorrent").await;
        assert!(!report.healthy);
        assert_eq!(report.consecutive_failures, 1);
        assert_eq!(backend.probes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_down_after_threshold_and_recovery() {
        let backend = Arc::new(ProbeBackend {
            healthy: AtomicBool::new(false),
            probes: AtomicU32::new(0),
        });
        let monitor = monitor(Arc::clone(&backend), settings(0, 2));

        assert!(!monitor.health_check("qbittorrent").await.down);
        assert!(monitor.health_check("qbittorrent").await.down);
        assert_eq!(monitor.consecutive_failures("qbittorrent"), 2);

        backend.healthy.store(true, Ordering::SeqCst);
        let report = monitor.health_check("qbittorrent").await;
        assert!(report.healthy);
        assert!(!report.down);
        assert_eq!(monitor.consecutive_failures("qbittorrent"), 0);
    }

    #[tokio::test]
    async fn test_unknown_backend_reports_unhealthy() {
        let backend = Arc::new(ProbeBackend {
            healthy: AtomicBool::new(true),
            probes: AtomicU32::new(0),
        });
        let monitor = monitor(backend, settings(2, 3));

        let report = monitor.health_check("lidarr").await;
        assert!(!report.healthy);
        assert!(report.breaker_state.is_none());
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let backend = Arc::new(ProbeBackend {
            healthy: AtomicBool::new(true),
            probes: AtomicU32::new(0),
        });
        let monitor = monitor(backend, settings(2, 3));
        assert!(monitor.start_periodic(Duration::ZERO).is_err());
        assert!(!monitor.is_periodic_running());
    }
}
