//! Structured logging for the orchestrator workspace
//!
//! Installs a `tracing` subscriber with either a human readable `fmt` layer or a
//! JSON layer that emits one object per event. Orchestrator call sites attach
//! `backend`, `tool`, `attempt` and `elapsed_ms` fields; the JSON layer lifts
//! `elapsed_ms`/`duration_ms` into a dedicated timing block.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::OnceLock;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};

static LOGGING_INIT: OnceLock<()> = OnceLock::new();

/// Environment variable selecting the output format (`json` or `pretty`)
pub const LOG_FORMAT_ENV: &str = "ORCHESTRATOR_LOG_FORMAT";

/// Environment variable with the default level when `RUST_LOG` is unset
pub const LOG_LEVEL_ENV: &str = "ORCHESTRATOR_LOG_LEVEL";

/// One JSON log line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredLogEntry {
    /// RFC 3339 timestamp
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(flatten)]
    pub fields: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<HostContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<TimingMetrics>,
}

/// Process identity attached to JSON lines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostContext {
    pub app_version: String,
    pub hostname: String,
    pub pid: u32,
}

impl Default for HostContext {
    fn default() -> Self {
        Self {
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id(),
        }
    }
}

/// Timing fields extracted from an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingMetrics {
    pub elapsed_ms: Option<u64>,
    pub attempts: Option<u64>,
}

/// Layer writing `StructuredLogEntry` lines to stdout
pub struct JsonFormatter {
    host: HostContext,
    include_host: bool,
}

impl JsonFormatter {
    pub fn new(include_host: bool) -> Self {
        Self {
            host: HostContext::default(),
            include_host,
        }
    }

    fn build_entry(&self, event: &Event<'_>) -> StructuredLogEntry {
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);
        let timing = visitor.extract_timing();

        StructuredLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            level: level_name(event.metadata().level()).to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: visitor.fields,
            host: self.include_host.then(|| self.host.clone()),
            timing,
        }
    }
}

impl<S> Layer<S> for JsonFormatter
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let entry = self.build_entry(event);
        if let Ok(json) = serde_json::to_string(&entry) {
            let _ = writeln!(io::stdout(), "{}", json);
        }
    }
}

fn level_name(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "ERROR",
        Level::WARN => "WARN",
        Level::INFO => "INFO",
        Level::DEBUG => "DEBUG",
        Level::TRACE => "TRACE",
    }
}

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: HashMap<String, Value>,
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        } else {
            self.fields.insert(
                field.name().to_string(),
                Value::String(format!("{:?}", value)),
            );
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields
                .insert(field.name().to_string(), Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), Value::Number(value.into()));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.fields.insert(field.name().to_string(), Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), Value::Bool(value));
    }
}

impl JsonVisitor {
    fn extract_timing(&self) -> Option<TimingMetrics> {
        let elapsed_ms = self
            .get_u64_field("elapsed_ms")
            .or_else(|| self.get_u64_field("duration_ms"));
        let attempts = self.get_u64_field("attempts");

        if elapsed_ms.is_none() && attempts.is_none() {
            return None;
        }
        Some(TimingMetrics {
            elapsed_ms,
            attempts,
        })
    }

    fn get_u64_field(&self, name: &str) -> Option<u64> {
        self.fields.get(name).and_then(|v| v.as_u64())
    }
}

/// Output format for the subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    pub format: LogFormat,
    /// Colored output (pretty format only)
    pub color_output: bool,
    /// Attach host/pid to JSON lines
    pub include_host: bool,
    pub include_line_numbers: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            color_output: true,
            include_host: true,
            include_line_numbers: cfg!(debug_assertions),
        }
    }
}

impl LoggingConfig {
    /// Read format and level from `ORCHESTRATOR_LOG_FORMAT` / `ORCHESTRATOR_LOG_LEVEL`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(format) = std::env::var(LOG_FORMAT_ENV) {
            if format.eq_ignore_ascii_case("json") {
                config.format = LogFormat::Json;
            }
        }
        if let Ok(level) = std::env::var(LOG_LEVEL_ENV) {
            if let Ok(parsed) = level.parse::<Level>() {
                config.level = parsed;
            }
        }

        config
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_structured_logging(config: LoggingConfig) -> anyhow::Result<()> {
    let mut outcome = Ok(());

    LOGGING_INIT.get_or_init(|| {
        outcome = install_subscriber(&config);
    });

    outcome
}

fn install_subscriber(config: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

    match config.format {
        LogFormat::Json => {
            let subscriber = Registry::default()
                .with(env_filter)
                .with(JsonFormatter::new(config.include_host));
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .with_target(true)
                .with_line_number(config.include_line_numbers)
                .with_ansi(config.color_output)
                .with_span_events(FmtSpan::CLOSE);
            let subscriber = Registry::default().with(env_filter).with(fmt_layer);
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    Ok(())
}

/// Logs the duration of a coarse operation when finished
#[derive(Debug)]
pub struct OperationTimer {
    start: std::time::Instant,
    operation_name: String,
    fields: HashMap<String, Value>,
}

impl OperationTimer {
    pub fn new(operation_name: impl Into<String>) -> Self {
        Self {
            start: std::time::Instant::now(),
            operation_name: operation_name.into(),
            fields: HashMap::new(),
        }
    }

    pub fn add_field(&mut self, key: impl Into<String>, value: impl Serialize) {
        if let Ok(v) = serde_json::to_value(value) {
            self.fields.insert(key.into(), v);
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }

    pub fn finish(self) {
        let duration_ms = self.start.elapsed().as_millis() as u64;

        tracing::info!(
            operation = %self.operation_name,
            duration_ms = duration_ms,
            success = true,
            fields = ?self.fields,
            "Operation completed"
        );
    }

    pub fn finish_with_result<T, E: std::fmt::Display>(self, result: &Result<T, E>) {
        let duration_ms = self.start.elapsed().as_millis() as u64;

        match result {
            Ok(_) => {
                tracing::info!(
                    operation = %self.operation_name,
                    duration_ms = duration_ms,
                    success = true,
                    fields = ?self.fields,
                    "Operation completed"
                );
            }
            Err(e) => {
                tracing::error!(
                    operation = %self.operation_name,
                    duration_ms = duration_ms,
                    success = false,
                    error = %e,
                    fields = ?self.fields,
                    "Operation failed"
                );
            }
        }
    }
}
