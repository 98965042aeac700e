//! Backend Reliability Module
//!
//! Per-backend circuit breakers, retry with backoff, and health monitoring.
//! The tool router composes the first two: retry runs inside, the circuit
//! breaker wraps the whole retrying call.

pub mod circuit_breaker;
pub mod health;
pub mod retry_policy;

pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerError, CircuitBreakerState, CircuitBreakerStats,
};
pub use health::{AggregateHealthReport, HealthMonitor, HealthReport};
pub use retry_policy::{BackoffStrategy, RetryOutcome, RetryPolicy};
