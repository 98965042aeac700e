#![allow(dead_code)]
//! Scripted backends and orchestrator builders shared by the integration tests

use async_trait::async_trait;
use backend_orchestrator::{
    BackendCapability, BackendConfig, BackendError, BackendOrchestrator, OrchestratorConfig,
    SharedBackend, ToolDescriptor,
};
use common::{init_structured_logging, LoggingConfig};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn init_logging() {
    let _ = init_structured_logging(LoggingConfig::from_env());
}

/// Backend whose behaviour is scripted by the test.
///
/// `invoke` sleeps for the configured latency (or `params.delay_ms` when
/// present), then pops the next scripted response, falling back to echoing
/// the tool and params.
pub struct ScriptedBackend {
    name: String,
    connect_script: Mutex<VecDeque<Result<(), BackendError>>>,
    connect_latency: Mutex<Duration>,
    disconnect_result: Mutex<Result<(), BackendError>>,
    invoke_script: Mutex<VecDeque<Result<Value, BackendError>>>,
    invoke_fallback: Mutex<Option<Result<Value, BackendError>>>,
    latency: Mutex<Duration>,
    healthy: AtomicBool,
    connects: AtomicU32,
    disconnects: AtomicU32,
    invokes: AtomicU32,
    probes: AtomicU32,
    active: AtomicU32,
    max_active: AtomicU32,
    events: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            connect_script: Mutex::new(VecDeque::new()),
            connect_latency: Mutex::new(Duration::ZERO),
            disconnect_result: Mutex::new(Ok(())),
            invoke_script: Mutex::new(VecDeque::new()),
            invoke_fallback: Mutex::new(None),
            latency: Mutex::new(Duration::ZERO),
            healthy: AtomicBool::new(true),
            connects: AtomicU32::new(0),
            disconnects: AtomicU32::new(0),
            invokes: AtomicU32::new(0),
            probes: AtomicU32::new(0),
            active: AtomicU32::new(0),
            max_active: AtomicU32::new(0),
            events: Mutex::new(Vec::new()),
        })
    }

    /// Backend whose every connect attempt is refused
    pub fn unreachable(name: &str) -> Arc<Self> {
        let backend = Self::new(name);
        backend.fail_connects_with(BackendError::Connection("connection refused".into()));
        backend
    }

    pub fn script_connect(&self, result: Result<(), BackendError>) {
        self.connect_script.lock().push_back(result);
    }

    /// Every connect attempt without a scripted result fails with `error`
    pub fn fail_connects_with(&self, error: BackendError) {
        let mut script = self.connect_script.lock();
        script.clear();
        for _ in 0..1000 {
            script.push_back(Err(error.clone()));
        }
    }

    pub fn set_connect_latency(&self, latency: Duration) {
        *self.connect_latency.lock() = latency;
    }

    pub fn set_disconnect_result(&self, result: Result<(), BackendError>) {
        *self.disconnect_result.lock() = result;
    }

    pub fn script_invoke(&self, result: Result<Value, BackendError>) {
        self.invoke_script.lock().push_back(result);
    }

    /// Response for every invoke without a scripted one
    pub fn always_respond(&self, result: Result<Value, BackendError>) {
        *self.invoke_fallback.lock() = Some(result);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn invokes(&self) -> u32 {
        self.invokes.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_invokes(&self) -> u32 {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn record(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }
}

#[async_trait]
impl BackendCapability for ScriptedBackend {
    async fn connect(&self) -> Result<(), BackendError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let latency = *self.connect_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let result = self.connect_script.lock().pop_front().unwrap_or(Ok(()));
        self.record(if result.is_ok() { "connect" } else { "connect_failed" });
        result
    }

    async fn disconnect(&self) -> Result<(), BackendError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.record("disconnect");
        self.disconnect_result.lock().clone()
    }

    async fn invoke(&self, tool: &str, params: &Map<String, Value>) -> Result<Value, BackendError> {
        self.invokes.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        self.record(format!("invoke:{tool}"));

        let latency = params
            .get("delay_ms")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or_else(|| *self.latency.lock());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let scripted = self.invoke_script.lock().pop_front();
        let result = scripted
            .or_else(|| self.invoke_fallback.lock().clone())
            .unwrap_or_else(|| {
                Ok(json!({
                    "backend": self.name,
                    "tool": tool,
                    "params": Value::Object(params.clone()),
                }))
            });

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.record(format!("done:{tool}"));
        result
    }

    async fn is_healthy(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.healthy.load(Ordering::SeqCst)
    }

    fn tools(&self) -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor::new("search", format!("Search {}", self.name)),
            ToolDescriptor::new("status", format!("Status of {}", self.name)),
        ]
    }
}

/// Config with millisecond backoffs so retries do not slow tests down
pub fn fast_config(backends: Vec<BackendConfig>) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.backends = backends;
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 10;
    config.retry.jitter = false;
    config.reconnect.initial_delay_ms = 1;
    config.reconnect.max_delay_ms = 10;
    config.health.probe_retry_delay_ms = 1;
    config.shutdown_timeout_seconds = 30.0;
    config
}

pub fn build(
    config: OrchestratorConfig,
    backends: &[(&str, Arc<ScriptedBackend>)],
) -> Arc<BackendOrchestrator> {
    init_logging();
    let capabilities: HashMap<String, SharedBackend> = backends
        .iter()
        .map(|(name, backend)| (name.to_string(), Arc::clone(backend) as SharedBackend))
        .collect();
    Arc::new(BackendOrchestrator::new(config, capabilities).expect("valid orchestrator"))
}

/// The three media services most tests run against
pub fn media_backends() -> Vec<BackendConfig> {
    vec![
        BackendConfig::new("qbittorrent", "http://qbittorrent:8080")
            .with_aliases(["downloads", "torrent"]),
        BackendConfig::new("sonarr", "http://sonarr:8989").with_aliases(["tv", "series"]),
        BackendConfig::new("radarr", "http://radarr:7878").with_aliases(["movies"]),
    ]
}
