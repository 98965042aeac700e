//! Retry Policy Implementation
//!
//! Retries transient failures (connection, timeout) with a backoff between
//! attempts. Non-transient failures return immediately. Backoff sleeps are
//! registered with the [`ActivityTracker`] as pending retries so leak checks
//! can see them.

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;
use crate::lifecycle::ActivityTracker;
use crate::registry::{ReconnectSettings, RetrySettings};

/// Backoff strategies for retry delays
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed { delay: Duration },

    /// Exponential backoff: initial_delay * base^attempt, capped at max_delay
    Exponential {
        initial_delay: Duration,
        base: f64,
        max_delay: Duration,
        jitter: bool,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for BackoffStrategy {
    fn from(settings: &RetrySettings) -> Self {
        Self::Exponential {
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            base: settings.multiplier,
            max_delay: Duration::from_millis(settings.max_delay_ms),
            jitter: settings.jitter,
        }
    }
}

impl From<&ReconnectSettings> for BackoffStrategy {
    fn from(settings: &ReconnectSettings) -> Self {
        Self::Exponential {
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            base: settings.multiplier,
            max_delay: Duration::from_millis(settings.max_delay_ms),
            jitter: false,
        }
    }
}

impl BackoffStrategy {
    /// Calculate delay for given retry number (0-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,

            Self::Exponential {
                initial_delay,
                base,
                max_delay,
                jitter,
            } => {
                let base_delay =
                    initial_delay.as_millis() as f64 * base.max(1.0).powf(attempt as f64);
                let capped = base_delay.min(max_delay.as_millis() as f64);
                let delay = Duration::from_millis(capped as u64);

                if *jitter {
                    Self::add_jitter(delay).min(*max_delay)
                } else {
                    delay
                }
            }
        }
    }

    /// Add jitter to delay (±25% random variation)
    fn add_jitter(delay: Duration) -> Duration {
        let mut rng = rand::thread_rng();
        let jitter_factor = rng.gen_range(0.75..=1.25);
        let jittered_millis = (delay.as_millis() as f64 * jitter_factor) as u64;
        Duration::from_millis(jittered_millis)
    }
}

/// Outcome of a retried operation
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    /// Attempts made, including the first
    pub attempts: u32,
}

/// Retry policy for one backend operation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: BackoffStrategy,
    tracker: Option<Arc<ActivityTracker>>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: BackoffStrategy) -> Self {
        Self {
            max_retries,
            backoff,
            tracker: None,
        }
    }

    /// Single attempt, no retries
    pub fn no_retries() -> Self {
        Self::new(0, BackoffStrategy::Fixed {
            delay: Duration::ZERO,
        })
    }

    /// Register backoff sleeps with `tracker` as pending retries
    pub fn with_tracker(mut self, tracker: Arc<ActivityTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn backoff(&self) -> &BackoffStrategy {
        &self.backoff
    }

    /// Run `operation` until it succeeds, fails non-transiently, or the
    /// retries are used up. `operation` receives the 1-based attempt number.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 1;

        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempts = attempt, "Operation succeeded after retries");
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(error) => {
                    if !error.is_transient() {
                        debug!(
                            error = %error,
                            attempt = attempt,
                            "Operation failed permanently, not retrying"
                        );
                        return RetryOutcome {
                            result: Err(error),
                            attempts: attempt,
                        };
                    }

                    if attempt > self.max_retries {
                        warn!(
                            error = %error,
                            attempts = attempt,
                            max_retries = self.max_retries,
                            "Retries exhausted"
                        );
                        return RetryOutcome {
                            result: Err(error),
                            attempts: attempt,
                        };
                    }

                    let delay = self.backoff.calculate_delay(attempt - 1);
                    debug!(
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Operation failed, retrying after delay"
                    );

                    let _pending = self.tracker.as_ref().map(|tracker| tracker.retry_guard());
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
