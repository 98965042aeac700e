//! Usage counters and the `OrchestratorStats` snapshot

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::arena::BackendArena;
use crate::reliability::circuit_breaker::CircuitBreakerState;

/// Read-only snapshot returned by `stats()`
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub total_calls: u64,
    pub failed_calls: u64,
    pub calls_per_backend: BTreeMap<String, u64>,
    pub health_checks: u64,
    /// Execution slots currently held by parallel calls
    pub pool_in_use: usize,
    pub pool_capacity: usize,
    pub connected_backends: usize,
    pub in_flight_calls: usize,
    pub breaker_states: BTreeMap<String, CircuitBreakerState>,
    pub uptime: Duration,
    pub timestamp: DateTime<Utc>,
}

/// Live execution-slot and call occupancy, sampled when a snapshot is taken
#[derive(Debug, Clone, Copy, Default)]
pub struct Occupancy {
    pub pool_in_use: usize,
    pub pool_capacity: usize,
    pub in_flight_calls: usize,
}

/// Monotonic counters shared by the router and the health monitor
#[derive(Debug)]
pub struct StatsCollector {
    started_at: Instant,
    total_calls: AtomicU64,
    failed_calls: AtomicU64,
    health_checks: AtomicU64,
    calls_per_backend: DashMap<String, u64>,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            total_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            health_checks: AtomicU64::new(0),
            calls_per_backend: DashMap::new(),
        }
    }

    pub fn record_call(&self, backend: &str) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        *self
            .calls_per_backend
            .entry(backend.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_failure(&self) {
        self.failed_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_health_check(&self) {
        self.health_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    pub fn health_checks(&self) -> u64 {
        self.health_checks.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, arena: &BackendArena, occupancy: Occupancy) -> OrchestratorStats {
        OrchestratorStats {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            calls_per_backend: self
                .calls_per_backend
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
            health_checks: self.health_checks.load(Ordering::Relaxed),
            pool_in_use: occupancy.pool_in_use,
            pool_capacity: occupancy.pool_capacity,
            connected_backends: arena.connected_backends().len(),
            in_flight_calls: occupancy.in_flight_calls,
            breaker_states: arena
                .slots()
                .map(|slot| (slot.name().to_string(), slot.breaker().state()))
                .collect(),
            uptime: self.started_at.elapsed(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate_per_backend() {
        let stats = StatsCollector::new();
        stats.record_call("sonarr");
        stats.record_call("sonarr");
        stats.record_call("radarr");
        stats.record_failure();
        stats.record_health_check();

        assert_eq!(stats.total_calls(), 3);
        assert_eq!(stats.health_checks(), 1);
        assert_eq!(stats.calls_per_backend.get("sonarr").map(|v| *v), Some(2));
        assert_eq!(stats.failed_calls.load(Ordering::Relaxed), 1);
    }
}
