//! Backend capability seam
//!
//! Each downstream service (download client, library managers, media server)
//! is driven by a protocol client living outside this crate. The orchestrator
//! only sees the [`BackendCapability`] trait object registered for a backend
//! name and never inspects the concrete type.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by a backend client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    /// The service answered and refused the operation
    #[error("rejected by backend: {0}")]
    Rejected(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }
}

/// Description of one tool a backend exposes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the parameter object
    #[serde(default)]
    pub parameters: Value,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Value::Object(Map::new()),
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Capability every backend client implements
#[async_trait]
pub trait BackendCapability: Send + Sync {
    /// Establish the connection (session login, socket, process spawn...)
    async fn connect(&self) -> Result<(), BackendError>;

    /// Tear the connection down
    async fn disconnect(&self) -> Result<(), BackendError>;

    /// Run one tool with an already validated parameter object
    async fn invoke(&self, tool: &str, params: &Map<String, Value>) -> Result<Value, BackendError>;

    /// Lightweight liveness probe
    async fn is_healthy(&self) -> bool;

    /// Tools this backend answers to
    fn tools(&self) -> Vec<ToolDescriptor> {
        Vec::new()
    }
}

pub type SharedBackend = Arc<dyn BackendCapability>;
