//! Orchestrator error taxonomy
//!
//! Every operation exposed upward returns [`OrchestratorError`]. The variants
//! separate operational failures (backend unreachable, timeouts), caller
//! mistakes (validation) and explicit backoff signals (circuit open) so the API
//! layer can pick a remediation through [`OrchestratorError::kind`].

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::backend::BackendError;

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrchestratorError {
    #[error("Connection error for backend '{backend}': {message}")]
    Connection { backend: String, message: String },

    #[error("Tool '{tool}' failed on backend '{backend}': {message}")]
    ToolExecution {
        backend: String,
        tool: String,
        message: String,
    },

    #[error("Operation '{operation}' on backend '{backend}' timed out after {timeout:?}")]
    Timeout {
        backend: String,
        operation: String,
        timeout: Duration,
    },

    #[error("Circuit breaker open for backend '{backend}', retry after {retry_after:?}")]
    CircuitBreakerOpen {
        backend: String,
        retry_after: Duration,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Call cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("Orchestrator is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// User-facing classification of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Backend unreachable or slow; expected to recover on its own
    Unreachable,
    /// Malformed request; retrying will not help
    InvalidRequest,
    /// Circuit open; back off before retrying
    Degraded,
    /// The backend answered and refused the call
    Rejected,
    Cancelled,
    /// Orchestrator not serving (shutdown, misconfiguration, internal fault)
    Unavailable,
}

impl OrchestratorError {
    pub fn connection(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            backend: backend.into(),
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Map a capability error for `tool` on `backend`.
    ///
    /// `timeout` is the deadline that applied to the attempt.
    pub fn from_backend(
        backend: &str,
        tool: &str,
        timeout: Duration,
        error: BackendError,
    ) -> Self {
        match error {
            BackendError::Connection(message) => Self::Connection {
                backend: backend.to_string(),
                message,
            },
            BackendError::Timeout(_) => Self::Timeout {
                backend: backend.to_string(),
                operation: tool.to_string(),
                timeout,
            },
            BackendError::Rejected(message) => Self::ToolExecution {
                backend: backend.to_string(),
                tool: tool.to_string(),
                message,
            },
            BackendError::InvalidParams(message) => {
                Self::Validation(format!("{backend}/{tool}: {message}"))
            }
        }
    }

    /// Transient errors are eligible for retry
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } => ErrorKind::Unreachable,
            Self::Validation(_) => ErrorKind::InvalidRequest,
            Self::CircuitBreakerOpen { .. } => ErrorKind::Degraded,
            Self::ToolExecution { .. } => ErrorKind::Rejected,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::ShuttingDown | Self::Config(_) | Self::Internal(_) => ErrorKind::Unavailable,
        }
    }

    /// Backend the error refers to, when there is one
    pub fn backend(&self) -> Option<&str> {
        match self {
            Self::Connection { backend, .. }
            | Self::ToolExecution { backend, .. }
            | Self::Timeout { backend, .. }
            | Self::CircuitBreakerOpen { backend, .. } => Some(backend),
            _ => None,
        }
    }
}

impl From<serde_yaml::Error> for OrchestratorError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Config(format!("invalid YAML: {err}"))
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(format!("invalid JSON: {err}"))
    }
}
