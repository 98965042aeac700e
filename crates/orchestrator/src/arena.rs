//! Per-backend state arena
//!
//! Every configured backend gets one [`BackendSlot`] at construction time. A
//! slot bundles the backend's configuration, its capability object, its
//! circuit breaker and its connection status behind their own locks, so calls
//! against different backends never contend.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::backend::SharedBackend;
use crate::error::{OrchestratorError, Result};
use crate::registry::{BackendConfig, BackendRegistry};
use crate::reliability::circuit_breaker::CircuitBreaker;

/// Connection lifecycle of one backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Snapshot of a backend's connection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Connect attempts made since construction or the last reset
    pub connect_attempts: u64,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_error: None,
            last_connected_at: None,
            connect_attempts: 0,
        }
    }
}

pub struct BackendSlot {
    config: BackendConfig,
    capability: Option<SharedBackend>,
    breaker: Arc<CircuitBreaker>,
    status: RwLock<ConnectionStatus>,
    op_lock: Mutex<()>,
}

impl fmt::Debug for BackendSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSlot")
            .field("name", &self.config.name)
            .field("has_capability", &self.capability.is_some())
            .field("status", &*self.status.read())
            .field("breaker", &self.breaker.state())
            .finish()
    }
}

impl BackendSlot {
    fn new(config: BackendConfig, capability: Option<SharedBackend>) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            config.name.clone(),
            config.circuit_breaker.clone(),
        ));
        Self {
            config,
            capability,
            breaker,
            status: RwLock::new(ConnectionStatus::default()),
            op_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Capability of an enabled backend; disabled backends refuse every operation
    pub fn capability(&self) -> Result<&SharedBackend> {
        match (&self.capability, self.config.enabled) {
            (Some(capability), true) => Ok(capability),
            _ => Err(OrchestratorError::connection(
                self.name(),
                "backend is disabled",
            )),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.read().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.read().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Serialises connect/disconnect/reconnect for this backend
    pub async fn lock_ops(&self) -> MutexGuard<'_, ()> {
        self.op_lock.lock().await
    }

    pub(crate) fn update_status<F>(&self, update: F)
    where
        F: FnOnce(&mut ConnectionStatus),
    {
        let mut status = self.status.write();
        update(&mut status);
    }

    /// Back to Disconnected/Closed, keeping configuration and capability
    pub(crate) fn reset(&self) {
        *self.status.write() = ConnectionStatus::default();
        self.breaker.reset();
    }
}

/// Arena of backend slots keyed by canonical name
#[derive(Debug)]
pub struct BackendArena {
    registry: BackendRegistry,
    slots: BTreeMap<String, Arc<BackendSlot>>,
}

impl BackendArena {
    /// Pair every configured backend with its capability.
    ///
    /// Capabilities may be registered under a name or an alias. Enabled
    /// backends must have one; disabled backends may omit it.
    pub fn new(
        registry: BackendRegistry,
        capabilities: HashMap<String, SharedBackend>,
    ) -> Result<Self> {
        let mut by_name: HashMap<String, SharedBackend> = HashMap::new();

        for (key, capability) in capabilities {
            let canonical = registry.canonical_name(&key).ok_or_else(|| {
                OrchestratorError::config(format!(
                    "capability registered for unknown backend '{key}'"
                ))
            })?;
            if by_name.insert(canonical.to_string(), capability).is_some() {
                return Err(OrchestratorError::config(format!(
                    "more than one capability registered for backend '{canonical}'"
                )));
            }
        }

        let mut slots = BTreeMap::new();
        for config in registry.iter() {
            let capability = by_name.remove(&config.name);
            if config.enabled && capability.is_none() {
                return Err(OrchestratorError::config(format!(
                    "no capability registered for enabled backend '{}'",
                    config.name
                )));
            }
            slots.insert(
                config.name.clone(),
                Arc::new(BackendSlot::new(config.clone(), capability)),
            );
        }

        debug!(backends = slots.len(), "Backend arena created");
        Ok(Self { registry, slots })
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Resolve a backend name or alias (case-insensitive)
    pub fn resolve(&self, name_or_alias: &str) -> Result<&Arc<BackendSlot>> {
        self.registry
            .canonical_name(name_or_alias)
            .and_then(|name| self.slots.get(name))
            .ok_or_else(|| {
                OrchestratorError::validation(format!("unknown backend '{name_or_alias}'"))
            })
    }

    pub fn slots(&self) -> impl Iterator<Item = &Arc<BackendSlot>> {
        self.slots.values()
    }

    pub fn enabled_slots(&self) -> impl Iterator<Item = &Arc<BackendSlot>> {
        self.slots.values().filter(|slot| slot.config.enabled)
    }

    pub fn connected_backends(&self) -> Vec<String> {
        self.slots
            .values()
            .filter(|slot| slot.is_connected())
            .map(|slot| slot.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn reset(&self) {
        for slot in self.slots.values() {
            slot.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCapability, BackendError};
    use async_trait::async_trait;
    use serde_json::{Map, Value};

    struct NoopBackend;

    #[async_trait]
    impl BackendCapability for NoopBackend {
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
            true
        }
    }

    fn registry() -> BackendRegistry {
        BackendRegistry::new(vec![
            BackendConfig::new("sonarr", "http://sonarr").with_aliases(["tv"]),
            BackendConfig::new("plex", "http://plex").disabled(),
        ])
        .expect("valid registry")
    }

    #[test]
    fn test_capability_registered_by_alias() {
        let mut capabilities: HashMap<String, SharedBackend> = HashMap::new();
        capabilities.insert("TV".to_string(), Arc::new(NoopBackend));

        let arena = BackendArena::new(registry(), capabilities).expect("arena builds");
        assert_eq!(arena.len(), 2);

        let slot = arena.resolve("Sonarr").expect("resolves");
        assert_eq!(slot.name(), "sonarr");
        assert_eq!(slot.state(), ConnectionState::Disconnected);
        assert!(slot.capability().is_ok());

        let plex = arena.resolve("plex").expect("disabled backends still resolve");
        assert!(matches!(
            plex.capability(),
            Err(OrchestratorError::Connection { .. })
        ));
    }

    #[test]
    fn test_missing_capability_for_enabled_backend() {
        let result = BackendArena::new(registry(), HashMap::new());
        assert!(matches!(result, Err(OrchestratorError::Config(_))));
    }

    #[test]
    fn test_unknown_backend_is_validation_error() {
        let mut capabilities: HashMap<String, SharedBackend> = HashMap::new();
        capabilities.insert("sonarr".to_string(), Arc::new(NoopBackend));
        let arena = BackendArena::new(registry(), capabilities).expect("arena builds");

        assert!(matches!(
            arena.resolve("lidarr"),
            Err(OrchestratorError::Validation(_))
        ));
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let mut capabilities: HashMap<String, SharedBackend> = HashMap::new();
        capabilities.insert("sonarr".to_string(), Arc::new(NoopBackend));
        let arena = BackendArena::new(registry(), capabilities).expect("arena builds");

        let slot = arena.resolve("sonarr").expect("resolves");
        slot.update_status(|status| {
            status.state = ConnectionState::Connected;
            status.connect_attempts = 4;
        });
        assert_eq!(arena.connected_backends(), vec!["sonarr".to_string()]);

        arena.reset();
        assert_eq!(slot.status(), ConnectionStatus::default());
        assert!(arena.connected_backends().is_empty());
    }
}
