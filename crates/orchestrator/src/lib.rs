//! Multi-Backend Connection Orchestrator
//!
//! Owns the connections to every downstream media service (download client,
//! library managers, media server), exposes one tool-calling interface
//! regardless of which backend answers, tolerates partial outages, runs
//! batches of calls concurrently and keeps the system observably healthy.
//!
//! # Architecture
//!
//! - **BackendRegistry**: static backend configuration with alias resolution
//! - **BackendArena**: per-backend slot holding connection state, circuit
//!   breaker and capability, each behind its own lock
//! - **ConnectionManager**: connect/disconnect/reconnect with bounded
//!   concurrency and backoff
//! - **CircuitBreaker**: per-backend Closed/Open/HalfOpen state machine
//! - **ToolRouter**: validation, breaker admission, timeout and retry
//! - **ParallelExecutor**: ordered batch execution over a shared slot pool
//! - **HealthMonitor**: on-demand and periodic probes
//! - **LifecycleManager**: graceful/forced shutdown, restart, leak detection
//!
//! # Usage
//!
//! ```no_run
//! use backend_orchestrator::{BackendOrchestrator, OrchestratorConfig, ShutdownMode, SharedBackend};
//! use serde_json::json;
//! use std::collections::HashMap;
//!
//! # async fn run(capabilities: HashMap<String, SharedBackend>) -> backend_orchestrator::Result<()> {
//! let config = OrchestratorConfig::from_file("backends.yaml")?;
//! let orchestrator = BackendOrchestrator::new(config, capabilities)?;
//!
//! let report = orchestrator.connect_all().await?;
//! println!("connected: {:?}", report.connected());
//!
//! let result = orchestrator
//!     .call_tool("tv", "search_series", json!({"term": "Severance"}), None)
//!     .await?;
//! println!("{} answered in {:?}", result.backend, result.elapsed);
//!
//! orchestrator.shutdown(ShutdownMode::Graceful, None).await;
//! # Ok(())
//! # }
//! ```

pub mod arena;
pub mod backend;
pub mod connection;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod orchestrator;
pub mod registry;
pub mod reliability;
pub mod router;
pub mod stats;

pub use arena::{BackendArena, BackendSlot, ConnectionState, ConnectionStatus};
pub use backend::{BackendCapability, BackendError, SharedBackend, ToolDescriptor};
pub use connection::{ConnectAllReport, ConnectionManager};
pub use error::{ErrorKind, OrchestratorError, Result};
pub use executor::{BatchOptions, BatchProgress, FailurePolicy, ParallelExecutor, ProgressCallback};
pub use lifecycle::{
    ActivityTracker, LeakReport, LifecycleManager, LifecyclePhase, ShutdownMode, ShutdownReport,
};
pub use orchestrator::BackendOrchestrator;
pub use registry::{
    BackendConfig, BackendRegistry, CircuitBreakerSettings, HealthSettings, OrchestratorConfig,
    ReconnectSettings, RetrySettings,
};
pub use reliability::{
    AggregateHealthReport, BackoffStrategy, CallPermit, CircuitBreaker, CircuitBreakerError,
    CircuitBreakerState, CircuitBreakerStats, HealthMonitor, HealthReport, RetryOutcome,
    RetryPolicy,
};
pub use router::{ToolCall, ToolResult, ToolRouter};
pub use stats::{OrchestratorStats, StatsCollector};
