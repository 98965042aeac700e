//! Backend Orchestrator
//!
//! Central entry point owning the backend arena and every component built on
//! it. The API layer talks only to [`BackendOrchestrator`]:
//!
//! - connection lifecycle: `connect_all`, `connect`, `disconnect`,
//!   `disconnect_all`, `reconnect`, `is_connected`
//! - tool calls: `call_tool`, `call_tools_parallel`, `list_tools`,
//!   `list_all_tools`
//! - health: `health_check`, `health_check_all`, periodic checks
//! - lifecycle: `shutdown`, `restart`, `scoped`, `check_for_leaks`, `stats`

use futures::FutureExt;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

use crate::arena::{BackendArena, ConnectionStatus};
use crate::backend::{SharedBackend, ToolDescriptor};
use crate::connection::{ConnectAllReport, ConnectionManager};
use crate::error::Result;
use crate::executor::{BatchOptions, ParallelExecutor};
use crate::lifecycle::{
    ActivityTracker, LeakReport, LifecycleManager, LifecyclePhase, ShutdownMode, ShutdownReport,
};
use crate::registry::{BackendRegistry, OrchestratorConfig};
use crate::reliability::circuit_breaker::CircuitBreakerStats;
use crate::reliability::health::{AggregateHealthReport, HealthMonitor, HealthReport};
use crate::router::{ToolCall, ToolResult, ToolRouter};
use crate::stats::{Occupancy, OrchestratorStats, StatsCollector};

/// Multi-backend connection orchestrator
#[derive(Debug)]
pub struct BackendOrchestrator {
    id: Uuid,
    config: OrchestratorConfig,
    arena: Arc<BackendArena>,
    tracker: Arc<ActivityTracker>,
    stats: Arc<StatsCollector>,
    connections: Arc<ConnectionManager>,
    router: Arc<ToolRouter>,
    executor: ParallelExecutor,
    health: Arc<HealthMonitor>,
    lifecycle: LifecycleManager,
}

impl BackendOrchestrator {
    /// Build the orchestrator from configuration and one capability per
    /// enabled backend, keyed by backend name or alias.
    ///
    /// Every backend starts `Disconnected` with a closed circuit.
    pub fn new(
        config: OrchestratorConfig,
        capabilities: HashMap<String, SharedBackend>,
    ) -> Result<Self> {
        config.validate()?;

        let registry = BackendRegistry::new(config.backends.clone())?;
        let arena = Arc::new(BackendArena::new(registry, capabilities)?);
        let tracker = Arc::new(ActivityTracker::new());
        let stats = Arc::new(StatsCollector::new());

        let connections = Arc::new(ConnectionManager::new(
            Arc::clone(&arena),
            config.max_parallel_connections,
            config.reconnect.clone(),
            Arc::clone(&tracker),
        ));
        let router = Arc::new(ToolRouter::new(
            Arc::clone(&arena),
            config.retry.clone(),
            Arc::clone(&tracker),
            Arc::clone(&stats),
        ));
        let executor = ParallelExecutor::new(Arc::clone(&router), config.max_parallel_calls);
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&router),
            Arc::clone(&arena),
            config.health.clone(),
            Arc::clone(&stats),
        ));
        let lifecycle = LifecycleManager::new(
            Arc::clone(&tracker),
            Arc::clone(&connections),
            Arc::clone(&health),
            config.shutdown_timeout(),
        );

        let id = Uuid::new_v4();
        info!(
            orchestrator_id = %id,
            backends = arena.len(),
            max_parallel_calls = executor.capacity(),
            "Backend orchestrator created"
        );

        Ok(Self {
            id,
            config,
            arena,
            tracker,
            stats,
            connections,
            router,
            executor,
            health,
            lifecycle,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &BackendRegistry {
        self.arena.registry()
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.lifecycle.phase()
    }

    // Connection lifecycle

    pub async fn connect_all(&self) -> Result<ConnectAllReport> {
        self.connections.connect_all().await
    }

    pub async fn connect(&self, backend: &str) -> Result<()> {
        self.connections.connect(backend).await
    }

    pub async fn disconnect(&self, backend: &str) -> Result<()> {
        self.connections.disconnect(backend).await
    }

    pub async fn disconnect_all(&self) -> Vec<String> {
        self.connections.disconnect_all().await
    }

    pub async fn reconnect(&self, backend: &str) -> Result<()> {
        self.connections.reconnect(backend).await
    }

    pub fn is_connected(&self, backend: &str) -> bool {
        self.connections.is_connected(backend)
    }

    pub fn connection_status(&self, backend: &str) -> Option<ConnectionStatus> {
        self.connections.status(backend)
    }

    pub fn connection_statuses(&self) -> BTreeMap<String, ConnectionStatus> {
        self.connections.statuses()
    }

    pub fn circuit_breaker_stats(&self, backend: &str) -> Option<CircuitBreakerStats> {
        self.arena
            .resolve(backend)
            .ok()
            .map(|slot| slot.breaker().stats())
    }

    // Tool calls

    pub async fn call_tool(
        &self,
        backend: &str,
        tool: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<ToolResult> {
        self.router.call_tool(backend, tool, params, timeout).await
    }

    pub async fn call_tools_parallel(&self, calls: Vec<ToolCall>) -> Vec<Result<ToolResult>> {
        self.executor.call_tools_parallel(calls).await
    }

    pub async fn call_tools_parallel_with(
        &self,
        calls: Vec<ToolCall>,
        options: BatchOptions,
    ) -> Vec<Result<ToolResult>> {
        self.executor.call_tools_parallel_with(calls, options).await
    }

    pub fn list_tools(&self, backend: &str) -> Result<Vec<ToolDescriptor>> {
        self.router.list_tools(backend)
    }

    pub fn list_all_tools(&self) -> BTreeMap<String, Vec<ToolDescriptor>> {
        self.router.list_all_tools()
    }

    // Health

    pub async fn health_check(&self, backend: &str) -> HealthReport {
        self.health.health_check(backend).await
    }

    pub async fn health_check_all(&self) -> AggregateHealthReport {
        self.health.health_check_all().await
    }

    pub fn start_periodic_health_checks(&self, interval: Duration) -> Result<()> {
        self.health.start_periodic(interval)
    }

    pub async fn stop_periodic_health_checks(&self) {
        self.health.stop_periodic().await
    }

    pub fn is_periodic_health_check_running(&self) -> bool {
        self.health.is_periodic_running()
    }

    // Lifecycle

    /// Stop serving calls and disconnect everything. Calling it again once
    /// stopped is a no-op.
    pub async fn shutdown(&self, mode: ShutdownMode, timeout: Option<Duration>) -> ShutdownReport {
        self.lifecycle.shutdown(mode, timeout).await
    }

    pub async fn restart(&self) -> Result<ConnectAllReport> {
        self.lifecycle.restart().await
    }

    pub fn check_for_leaks(&self) -> LeakReport {
        self.lifecycle.check_for_leaks()
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.stats.snapshot(
            &self.arena,
            Occupancy {
                pool_in_use: self.executor.in_use(),
                pool_capacity: self.executor.capacity(),
                in_flight_calls: self.tracker.in_flight(),
            },
        )
    }

    /// Connect, run `body`, and shut down on every exit path.
    ///
    /// A body that returns (with success or error) gets a graceful shutdown.
    /// A panicking body gets a forced shutdown and the panic is resumed.
    pub async fn scoped<T, F, Fut>(self: Arc<Self>, body: F) -> Result<T>
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Err(error) = self.connect_all().await {
            self.shutdown(ShutdownMode::Graceful, None).await;
            return Err(error);
        }

        match AssertUnwindSafe(body(Arc::clone(&self))).catch_unwind().await {
            Ok(result) => {
                self.shutdown(ShutdownMode::Graceful, None).await;
                result
            }
            Err(panic) => {
                error!(orchestrator_id = %self.id, "Scoped body panicked, forcing shutdown");
                self.shutdown(ShutdownMode::Forced, None).await;
                std::panic::resume_unwind(panic)
            }
        }
    }
}
