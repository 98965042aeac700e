//! Connection Manager
//!
//! Owns the connect/disconnect/reconnect lifecycle of every backend. All state
//! changes of a backend happen while holding that backend's operation lock;
//! readers take lock-free snapshots from the arena.

use chrono::Utc;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use common::OperationTimer;

use crate::arena::{BackendArena, BackendSlot, ConnectionState, ConnectionStatus};
use crate::backend::SharedBackend;
use crate::error::{OrchestratorError, Result};
use crate::lifecycle::ActivityTracker;
use crate::registry::ReconnectSettings;
use crate::reliability::retry_policy::{BackoffStrategy, RetryPolicy};

/// Per-backend outcome of `connect_all`
#[derive(Debug, Clone, Default)]
pub struct ConnectAllReport {
    pub results: BTreeMap<String, std::result::Result<(), OrchestratorError>>,
}

impl ConnectAllReport {
    pub fn connected(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, result)| result.is_ok())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn failed(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, result)| result.is_err())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn is_connected(&self, backend: &str) -> bool {
        matches!(self.results.get(backend), Some(Ok(())))
    }

    pub fn error(&self, backend: &str) -> Option<&OrchestratorError> {
        self.results.get(backend).and_then(|result| result.as_ref().err())
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.values().all(|result| result.is_ok())
    }
}

#[derive(Debug)]
pub struct ConnectionManager {
    arena: Arc<BackendArena>,
    connect_slots: Semaphore,
    reconnect: ReconnectSettings,
    tracker: Arc<ActivityTracker>,
}

impl ConnectionManager {
    pub fn new(
        arena: Arc<BackendArena>,
        max_parallel_connections: usize,
        reconnect: ReconnectSettings,
        tracker: Arc<ActivityTracker>,
    ) -> Self {
        Self {
            arena,
            connect_slots: Semaphore::new(max_parallel_connections.max(1)),
            reconnect,
            tracker,
        }
    }

    /// Connect every enabled backend, at most `max_parallel_connections` at
    /// a time.
    ///
    /// Individual failures land in the report. The call itself fails only
    /// when every backend failed and at least one of them is required.
    pub async fn connect_all(&self) -> Result<ConnectAllReport> {
        let mut timer = OperationTimer::new("connect_all");

        let attempts = self.arena.enabled_slots().map(|slot| async move {
            let result = match self.connect_slots.acquire().await {
                Ok(_permit) => self.connect_slot(slot).await,
                Err(_) => Err(OrchestratorError::Internal(
                    "connection limiter closed".to_string(),
                )),
            };
            (slot.name().to_string(), result)
        });

        let report = ConnectAllReport {
            results: join_all(attempts).await.into_iter().collect(),
        };

        for (name, result) in &report.results {
            if let Err(error) = result {
                warn!(backend = %name, error = %error, "Backend failed to connect");
            }
        }

        let required_failed: Vec<&str> = report
            .failed()
            .into_iter()
            .filter(|name| {
                self.arena
                    .resolve(name)
                    .map(|slot| slot.config().required)
                    .unwrap_or(false)
            })
            .collect();

        timer.add_field("connected", report.connected().len());
        timer.add_field("failed", report.failed().len());

        let all_failed = !report.results.is_empty() && report.connected().is_empty();
        if all_failed && !required_failed.is_empty() {
            let error = OrchestratorError::connection(
                required_failed.join(","),
                format!(
                    "no backend could be connected ({} attempted)",
                    report.results.len()
                ),
            );
            timer.finish_with_result(&Err::<(), _>(error.clone()));
            return Err(error);
        }

        timer.finish();
        Ok(report)
    }

    /// Connect one backend. Already connected backends are left untouched.
    pub async fn connect(&self, name: &str) -> Result<()> {
        let slot = self.arena.resolve(name)?;
        self.connect_slot(slot).await
    }

    /// Disconnect one backend. The backend ends up `Disconnected` even when
    /// the capability reports an error, which is then returned.
    pub async fn disconnect(&self, name: &str) -> Result<()> {
        let slot = self.arena.resolve(name)?;
        self.disconnect_slot(slot).await
    }

    /// Disconnect every backend, returning the names whose disconnect failed
    pub async fn disconnect_all(&self) -> Vec<String> {
        let attempts = self
            .arena
            .slots()
            .filter(|slot| slot.state() != ConnectionState::Disconnected)
            .map(|slot| async move { (slot.name().to_string(), self.disconnect_slot(slot).await) });

        let mut failed = Vec::new();
        for (name, result) in join_all(attempts).await {
            if let Err(error) = result {
                warn!(backend = %name, error = %error, "Disconnect failed");
                failed.push(name);
            }
        }
        failed
    }

    /// Drop the connection and connect again with exponential backoff.
    /// A forced shutdown cancels the remaining attempts.
    pub async fn reconnect(&self, name: &str) -> Result<()> {
        let slot = self.arena.resolve(name)?;
        let capability = slot.capability()?;
        let _ops = slot.lock_ops().await;

        let was_connected = slot.is_connected();
        slot.update_status(|status| status.state = ConnectionState::Reconnecting);
        info!(backend = %slot.name(), "Reconnecting backend");

        if was_connected {
            let timeout = slot.config().timeout();
            match tokio::time::timeout(timeout, capability.disconnect()).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    debug!(backend = %slot.name(), error = %error, "Disconnect before reconnect failed")
                }
                Err(_) => debug!(backend = %slot.name(), "Disconnect before reconnect timed out"),
            }
        }

        let policy = RetryPolicy::new(
            self.reconnect.max_attempts.saturating_sub(1),
            BackoffStrategy::from(&self.reconnect),
        )
        .with_tracker(Arc::clone(&self.tracker));

        // A forced shutdown abandons the backoff loop so it can release the
        // operation lock
        let shutdown = self.tracker.current_token();
        let outcome = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                slot.update_status(|status| status.state = ConnectionState::Disconnected);
                info!(backend = %slot.name(), "Reconnect cancelled by shutdown");
                return Err(OrchestratorError::cancelled(format!(
                    "reconnect of {} cancelled by shutdown",
                    slot.name()
                )));
            }
            outcome = policy.execute(move |_| self.try_connect(slot, capability)) => outcome,
        };

        if let Err(error) = &outcome.result {
            slot.update_status(|status| status.state = ConnectionState::Disconnected);
            warn!(
                backend = %slot.name(),
                attempts = outcome.attempts,
                error = %error,
                "Reconnect failed"
            );
        } else {
            info!(backend = %slot.name(), attempts = outcome.attempts, "Backend reconnected");
        }
        outcome.result
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.arena
            .resolve(name)
            .map(|slot| slot.is_connected())
            .unwrap_or(false)
    }

    pub fn status(&self, name: &str) -> Option<ConnectionStatus> {
        self.arena.resolve(name).ok().map(|slot| slot.status())
    }

    pub fn statuses(&self) -> BTreeMap<String, ConnectionStatus> {
        self.arena
            .slots()
            .map(|slot| (slot.name().to_string(), slot.status()))
            .collect()
    }

    pub fn connected_backends(&self) -> Vec<String> {
        self.arena.connected_backends()
    }

    /// Reset connection and breaker state of every backend
    pub fn reset(&self) {
        self.arena.reset();
    }

    async fn connect_slot(&self, slot: &BackendSlot) -> Result<()> {
        let capability = slot.capability()?;
        let _ops = slot.lock_ops().await;

        if slot.is_connected() {
            debug!(backend = %slot.name(), "Already connected, reusing connection");
            return Ok(());
        }

        slot.update_status(|status| status.state = ConnectionState::Connecting);
        let result = self.try_connect(slot, capability).await;
        if result.is_err() {
            slot.update_status(|status| status.state = ConnectionState::Disconnected);
        }
        result
    }

    /// One connect attempt under the backend timeout. Marks the slot
    /// connected on success and records the error otherwise; the caller owns
    /// the failure state.
    async fn try_connect(&self, slot: &BackendSlot, capability: &SharedBackend) -> Result<()> {
        let timeout = slot.config().timeout();
        let started = Instant::now();
        slot.update_status(|status| status.connect_attempts += 1);

        let result = match tokio::time::timeout(timeout, capability.connect()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(OrchestratorError::from_backend(
                slot.name(),
                "connect",
                timeout,
                error,
            )),
            Err(_) => Err(OrchestratorError::Timeout {
                backend: slot.name().to_string(),
                operation: "connect".to_string(),
                timeout,
            }),
        };

        match &result {
            Ok(()) => {
                slot.update_status(|status| {
                    status.state = ConnectionState::Connected;
                    status.last_error = None;
                    status.last_connected_at = Some(Utc::now());
                });
                info!(
                    backend = %slot.name(),
                    address = %slot.config().address,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Backend connected"
                );
            }
            Err(error) => {
                let message = error.to_string();
                slot.update_status(|status| status.last_error = Some(message));
                debug!(backend = %slot.name(), error = %error, "Connect attempt failed");
            }
        }
        result
    }

    async fn disconnect_slot(&self, slot: &BackendSlot) -> Result<()> {
        let _ops = slot.lock_ops().await;
        if slot.state() == ConnectionState::Disconnected {
            return Ok(());
        }

        let result = match slot.capability() {
            Ok(capability) => {
                let timeout = slot.config().timeout();
                match tokio::time::timeout(timeout, capability.disconnect()).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(error)) => Err(OrchestratorError::from_backend(
                        slot.name(),
                        "disconnect",
                        timeout,
                        error,
                    )),
                    Err(_) => Err(OrchestratorError::Timeout {
                        backend: slot.name().to_string(),
                        operation: "disconnect".to_string(),
                        timeout,
                    }),
                }
            }
            Err(_) => Ok(()),
        };

        slot.update_status(|status| {
            status.state = ConnectionState::Disconnected;
            if let Err(error) = &result {
                status.last_error = Some(error.to_string());
            }
        });
        info!(backend = %slot.name(), "Backend disconnected");
        result
    }
}
