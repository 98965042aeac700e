//! Backend Registry and orchestrator configuration
//!
//! Configuration arrives as YAML or JSON with camelCase keys:
//!
//! ```yaml
//! maxParallelCalls: 8
//! backends:
//!   - name: sonarr
//!     aliases: [tv, series]
//!     address: http://sonarr:8989
//!     credential: ${SONARR_API_KEY}
//!     timeoutSeconds: 10
//!     maxRetries: 2
//!     circuitBreaker:
//!       failureThreshold: 5
//!       openDurationSeconds: 30
//!       halfOpenSuccessThreshold: 2
//! ```
//!
//! The registry is immutable once built; lookups are case-insensitive and
//! resolve aliases to the canonical backend name.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::error::{OrchestratorError, Result};

/// Circuit breaker thresholds of one backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before a trial call
    pub open_duration_seconds: f64,
    /// Consecutive half-open successes that close the circuit
    pub half_open_success_threshold: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration_seconds: 30.0,
            half_open_success_threshold: 2,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn open_duration(&self) -> Duration {
        seconds(self.open_duration_seconds)
    }
}

/// Static configuration of one downstream service
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub address: String,
    #[serde(default)]
    pub credential: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// A required backend failing makes `connect_all` and aggregate health fail
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_seconds() -> f64 {
    30.0
}

fn default_max_retries() -> u32 {
    2
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("address", &self.address)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .field("enabled", &self.enabled)
            .field("required", &self.required)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("max_retries", &self.max_retries)
            .field("circuit_breaker", &self.circuit_breaker)
            .finish()
    }
}

impl BackendConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            address: address.into(),
            credential: None,
            enabled: true,
            required: false,
            timeout_seconds: default_timeout_seconds(),
            max_retries: default_max_retries(),
            circuit_breaker: CircuitBreakerSettings::default(),
        }
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = aliases.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_seconds = timeout.as_secs_f64();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_circuit_breaker(mut self, settings: CircuitBreakerSettings) -> Self {
        self.circuit_breaker = settings;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Default per-call timeout
    pub fn timeout(&self) -> Duration {
        seconds(self.timeout_seconds)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(OrchestratorError::config("backend name must not be empty"));
        }
        if self.address.trim().is_empty() {
            return Err(OrchestratorError::config(format!(
                "backend '{}' has an empty address",
                self.name
            )));
        }
        if !(self.timeout_seconds > 0.0 && is_duration(self.timeout_seconds)) {
            return Err(OrchestratorError::config(format!(
                "backend '{}' timeoutSeconds must be a positive duration",
                self.name
            )));
        }

        let cb = &self.circuit_breaker;
        if cb.failure_threshold == 0 || cb.half_open_success_threshold == 0 {
            return Err(OrchestratorError::config(format!(
                "backend '{}' circuit breaker thresholds must be at least 1",
                self.name
            )));
        }
        if !is_duration(cb.open_duration_seconds) {
            return Err(OrchestratorError::config(format!(
                "backend '{}' openDurationSeconds must be a non-negative duration",
                self.name
            )));
        }

        Ok(())
    }
}

/// Backoff applied by `reconnect`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

/// Backoff between tool call retries; the retry count is per backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthSettings {
    /// Extra probe attempts after a transient probe failure
    pub probe_retries: u32,
    pub probe_retry_delay_ms: u64,
    /// Consecutive failed checks before a backend is reported down
    pub down_threshold: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            probe_retries: 2,
            probe_retry_delay_ms: 250,
            down_threshold: 3,
        }
    }
}

/// Top-level orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorConfig {
    pub backends: Vec<BackendConfig>,
    /// Concurrent connection attempts during `connect_all`
    pub max_parallel_connections: usize,
    /// Execution slots shared by all parallel batches
    pub max_parallel_calls: usize,
    pub reconnect: ReconnectSettings,
    pub retry: RetrySettings,
    pub health: HealthSettings,
    pub shutdown_timeout_seconds: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            max_parallel_connections: 4,
            max_parallel_calls: 10,
            reconnect: ReconnectSettings::default(),
            retry: RetrySettings::default(),
            health: HealthSettings::default(),
            shutdown_timeout_seconds: 30.0,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn from_yaml_str(source: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(source: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.yaml`/`.yml` or `.json` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::config(format!("cannot read {}: {e}", path.display()))
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&source),
            Some("json") => Self::from_json_str(&source),
            other => Err(OrchestratorError::config(format!(
                "unsupported config extension {:?} for {}",
                other,
                path.display()
            ))),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        seconds(self.shutdown_timeout_seconds)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_connections == 0 {
            return Err(OrchestratorError::config(
                "maxParallelConnections must be at least 1",
            ));
        }
        if self.max_parallel_calls == 0 {
            return Err(OrchestratorError::config("maxParallelCalls must be at least 1"));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(OrchestratorError::config(
                "reconnect.maxAttempts must be at least 1",
            ));
        }
        if !is_duration(self.shutdown_timeout_seconds) {
            return Err(OrchestratorError::config(
                "shutdownTimeoutSeconds must be a non-negative duration",
            ));
        }
        // Building the registry checks every backend plus name/alias collisions
        BackendRegistry::new(self.backends.clone()).map(|_| ())
    }
}

/// Immutable set of backend configurations with alias resolution
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, BackendConfig>,
    /// lowercase name or alias -> canonical name
    lookup: HashMap<String, String>,
}

impl BackendRegistry {
    pub fn new(configs: Vec<BackendConfig>) -> Result<Self> {
        let mut registry = Self::default();

        for config in configs {
            config.validate()?;
            let canonical = config.name.clone();

            for key in std::iter::once(&config.name).chain(config.aliases.iter()) {
                let key = key.trim().to_lowercase();
                if key.is_empty() {
                    return Err(OrchestratorError::config(format!(
                        "backend '{canonical}' has an empty alias"
                    )));
                }
                if let Some(existing) = registry.lookup.get(&key) {
                    if existing != &canonical {
                        return Err(OrchestratorError::config(format!(
                            "name or alias '{key}' is used by both '{existing}' and '{canonical}'"
                        )));
                    }
                    continue;
                }
                registry.lookup.insert(key, canonical.clone());
            }

            if registry.backends.insert(canonical.clone(), config).is_some() {
                return Err(OrchestratorError::config(format!(
                    "duplicate backend '{canonical}'"
                )));
            }
        }

        Ok(registry)
    }

    /// Canonical name for a backend name or alias
    pub fn canonical_name(&self, name_or_alias: &str) -> Option<&str> {
        self.lookup
            .get(&name_or_alias.trim().to_lowercase())
            .map(String::as_str)
    }

    pub fn resolve(&self, name_or_alias: &str) -> Option<&BackendConfig> {
        self.canonical_name(name_or_alias)
            .and_then(|name| self.backends.get(name))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackendConfig> {
        self.backends.values()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &BackendConfig> {
        self.backends.values().filter(|config| config.enabled)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

/// Finite, non-negative and small enough to fit a `Duration`
fn is_duration(value: f64) -> bool {
    Duration::try_from_secs_f64(value).is_ok()
}

fn seconds(value: f64) -> Duration {
    if value.is_nan() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}
