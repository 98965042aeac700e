//! Tool Router
//!
//! Validates a single tool call, resolves the backend, asks its circuit
//! breaker for admission and dispatches with timeout and retry. The breaker
//! wraps the whole retrying call and hears exactly one outcome per call.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::arena::{BackendArena, BackendSlot};
use crate::backend::{SharedBackend, ToolDescriptor};
use crate::error::{OrchestratorError, Result};
use crate::lifecycle::ActivityTracker;
use crate::registry::RetrySettings;
use crate::reliability::retry_policy::{BackoffStrategy, RetryPolicy};
use crate::stats::StatsCollector;

/// One logical tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub backend: String,
    pub tool: String,
    #[serde(default)]
    pub params: Value,
    /// Overrides the backend's default timeout
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Failure of a critical call cancels its batch under
    /// `FailurePolicy::CancelRemaining`
    #[serde(default = "default_critical")]
    pub critical: bool,
}

fn default_critical() -> bool {
    true
}

impl ToolCall {
    pub fn new(backend: impl Into<String>, tool: impl Into<String>, params: Value) -> Self {
        Self {
            backend: backend.into(),
            tool: tool.into(),
            params,
            timeout: None,
            critical: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }
}

/// Successful outcome of a tool call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    /// Canonical backend name
    pub backend: String,
    pub tool: String,
    pub payload: Value,
    pub elapsed: Duration,
    /// Attempts made, including retries
    pub attempts: u32,
}

#[derive(Debug)]
pub struct ToolRouter {
    arena: Arc<BackendArena>,
    retry: RetrySettings,
    tracker: Arc<ActivityTracker>,
    stats: Arc<StatsCollector>,
}

impl ToolRouter {
    pub fn new(
        arena: Arc<BackendArena>,
        retry: RetrySettings,
        tracker: Arc<ActivityTracker>,
        stats: Arc<StatsCollector>,
    ) -> Self {
        Self {
            arena,
            retry,
            tracker,
            stats,
        }
    }

    pub fn tracker(&self) -> &Arc<ActivityTracker> {
        &self.tracker
    }

    /// Call `tool` on `backend` (name or alias).
    ///
    /// Rejected with `ShuttingDown` once shutdown has begun; a forced
    /// shutdown turns the call into `Cancelled`.
    pub async fn call_tool(
        &self,
        backend: &str,
        tool: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<ToolResult> {
        let guard = self.tracker.begin_call()?;

        tokio::select! {
            biased;
            _ = guard.token().cancelled() => {
                debug!(backend = %backend, tool = %tool, "Call cancelled by shutdown");
                Err(OrchestratorError::cancelled("orchestrator shutdown"))
            }
            result = self.dispatch(backend, tool, params, timeout) => result,
        }
    }

    pub async fn execute(&self, call: ToolCall) -> Result<ToolResult> {
        self.call_tool(&call.backend, &call.tool, call.params, call.timeout)
            .await
    }

    /// Liveness probe along the call path: connection check, breaker
    /// admission and `is_healthy` under the backend timeout. Retries run
    /// inside one admission, so the breaker hears one outcome per probe.
    pub async fn probe(&self, backend: &str, policy: &RetryPolicy) -> Result<Duration> {
        let slot = self.arena.resolve(backend)?;
        let capability = Self::connected_capability(slot)?;
        let permit = slot.breaker().try_acquire()?;

        let timeout = slot.config().timeout();
        let outcome = policy
            .execute(move |_| Self::probe_once(slot, capability, timeout))
            .await;

        match &outcome.result {
            Ok(_) => permit.success(),
            Err(_) => permit.failure(),
        }
        debug!(
            backend = %slot.name(),
            attempts = outcome.attempts,
            healthy = outcome.result.is_ok(),
            "Health probe finished"
        );
        outcome.result
    }

    async fn probe_once(
        slot: &BackendSlot,
        capability: &SharedBackend,
        timeout: Duration,
    ) -> Result<Duration> {
        let started = Instant::now();
        match tokio::time::timeout(timeout, capability.is_healthy()).await {
            Ok(true) => Ok(started.elapsed()),
            Ok(false) => Err(OrchestratorError::connection(
                slot.name(),
                "health probe reported unhealthy",
            )),
            Err(_) => Err(OrchestratorError::Timeout {
                backend: slot.name().to_string(),
                operation: "health_probe".to_string(),
                timeout,
            }),
        }
    }

    /// Tools exposed by one backend
    pub fn list_tools(&self, backend: &str) -> Result<Vec<ToolDescriptor>> {
        let slot = self.arena.resolve(backend)?;
        Ok(slot.capability()?.tools())
    }

    /// Tools of every enabled backend, keyed by canonical name
    pub fn list_all_tools(&self) -> BTreeMap<String, Vec<ToolDescriptor>> {
        self.arena
            .enabled_slots()
            .filter_map(|slot| {
                slot.capability()
                    .ok()
                    .map(|capability| (slot.name().to_string(), capability.tools()))
            })
            .collect()
    }

    async fn dispatch(
        &self,
        backend: &str,
        tool: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<ToolResult> {
        let slot = self.arena.resolve(backend)?;

        let tool = tool.trim();
        if tool.is_empty() {
            return Err(OrchestratorError::validation("tool name must not be empty"));
        }
        let params = match params {
            Value::Object(map) => map,
            other => {
                return Err(OrchestratorError::validation(format!(
                    "params for {}/{} must be a JSON object, got {}",
                    slot.name(),
                    tool,
                    json_type(&other)
                )))
            }
        };

        self.stats.record_call(slot.name());
        let result = self.dispatch_admitted(slot, tool, &params, timeout).await;
        if result.is_err() {
            self.stats.record_failure();
        }
        result
    }

    async fn dispatch_admitted(
        &self,
        slot: &BackendSlot,
        tool: &str,
        params: &Map<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<ToolResult> {
        let capability = Self::connected_capability(slot)?;
        let permit = slot.breaker().try_acquire()?;

        let timeout = timeout.unwrap_or_else(|| slot.config().timeout());
        let policy = RetryPolicy::new(slot.config().max_retries, BackoffStrategy::from(&self.retry))
            .with_tracker(Arc::clone(&self.tracker));
        let started = Instant::now();

        let outcome = policy
            .execute(move |attempt| Self::invoke_once(slot, capability, tool, params, timeout, attempt))
            .await;
        let elapsed = started.elapsed();

        match outcome.result {
            Ok(payload) => {
                permit.success();
                info!(
                    backend = %slot.name(),
                    tool = %tool,
                    attempts = outcome.attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Tool call completed"
                );
                Ok(ToolResult {
                    backend: slot.name().to_string(),
                    tool: tool.to_string(),
                    payload,
                    elapsed,
                    attempts: outcome.attempts,
                })
            }
            Err(error) => {
                // The backend answered a malformed request; it is not failing
                if matches!(error, OrchestratorError::Validation(_)) {
                    permit.success();
                } else {
                    permit.failure();
                }
                warn!(
                    backend = %slot.name(),
                    tool = %tool,
                    attempts = outcome.attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %error,
                    "Tool call failed"
                );
                Err(error)
            }
        }
    }

    async fn invoke_once(
        slot: &BackendSlot,
        capability: &SharedBackend,
        tool: &str,
        params: &Map<String, Value>,
        timeout: Duration,
        attempt: u32,
    ) -> Result<Value> {
        debug!(backend = %slot.name(), tool = %tool, attempt = attempt, "Invoking tool");

        match tokio::time::timeout(timeout, capability.invoke(tool, params)).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(error)) => Err(OrchestratorError::from_backend(
                slot.name(),
                tool,
                timeout,
                error,
            )),
            Err(_) => Err(OrchestratorError::Timeout {
                backend: slot.name().to_string(),
                operation: tool.to_string(),
                timeout,
            }),
        }
    }

    fn connected_capability(slot: &BackendSlot) -> Result<&SharedBackend> {
        let capability = slot.capability()?;
        if !slot.is_connected() {
            return Err(OrchestratorError::connection(
                slot.name(),
                format!("backend is {}", slot.state()),
            ));
        }
        Ok(capability)
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
