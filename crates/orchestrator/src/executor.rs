//! Parallel Executor
//!
//! Fans a batch of tool calls out over a pool of execution slots shared by
//! every batch. Results come back in input order; each slot holds its own
//! success or error.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{OrchestratorError, Result};
use crate::router::{ToolCall, ToolResult, ToolRouter};

/// What a failing call does to the rest of its batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum FailurePolicy {
    /// Failures stay in their own result slot
    #[default]
    Continue,
    /// The first failing critical call cancels pending and in-flight siblings
    CancelRemaining,
}

/// Reported once per completed call
#[derive(Debug, Clone, Serialize)]
pub struct BatchProgress {
    pub index: usize,
    pub completed: usize,
    pub total: usize,
    pub backend: String,
    pub tool: String,
    pub success: bool,
}

pub type ProgressCallback = Arc<dyn Fn(BatchProgress) + Send + Sync>;

#[derive(Clone, Default)]
pub struct BatchOptions {
    pub failure_policy: FailurePolicy,
    pub progress: Option<ProgressCallback>,
}

impl fmt::Debug for BatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchOptions")
            .field("failure_policy", &self.failure_policy)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl BatchOptions {
    pub fn cancel_remaining() -> Self {
        Self {
            failure_policy: FailurePolicy::CancelRemaining,
            progress: None,
        }
    }

    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(BatchProgress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }
}

/// Shared state of one batch
struct Batch {
    total: usize,
    policy: FailurePolicy,
    progress: Option<ProgressCallback>,
    cancel: CancellationToken,
    trigger: OnceLock<usize>,
    completed: AtomicUsize,
}

impl Batch {
    fn cancelled_error(&self) -> OrchestratorError {
        match self.trigger.get() {
            Some(index) => {
                OrchestratorError::cancelled(format!("batch cancelled after call #{index} failed"))
            }
            None => OrchestratorError::cancelled("batch cancelled"),
        }
    }
}

#[derive(Debug)]
pub struct ParallelExecutor {
    router: Arc<ToolRouter>,
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl ParallelExecutor {
    pub fn new(router: Arc<ToolRouter>, max_parallel_calls: usize) -> Self {
        let capacity = max_parallel_calls.max(1);
        Self {
            router,
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held by running calls
    pub fn in_use(&self) -> usize {
        self.capacity
            .saturating_sub(self.slots.available_permits())
    }

    pub async fn call_tools_parallel(&self, calls: Vec<ToolCall>) -> Vec<Result<ToolResult>> {
        self.call_tools_parallel_with(calls, BatchOptions::default())
            .await
    }

    /// Run every call concurrently; `result[i]` belongs to `calls[i]`
    pub async fn call_tools_parallel_with(
        &self,
        calls: Vec<ToolCall>,
        options: BatchOptions,
    ) -> Vec<Result<ToolResult>> {
        if calls.is_empty() {
            return Vec::new();
        }

        let batch = Arc::new(Batch {
            total: calls.len(),
            policy: options.failure_policy,
            progress: options.progress,
            cancel: CancellationToken::new(),
            trigger: OnceLock::new(),
            completed: AtomicUsize::new(0),
        });
        debug!(calls = batch.total, policy = ?batch.policy, "Dispatching batch");
        // Cancels the spawned calls if this future is dropped before they finish
        let abandoned = batch.cancel.clone().drop_guard();

        let handles: Vec<_> = calls
            .into_iter()
            .enumerate()
            .map(|(index, call)| {
                let router = Arc::clone(&self.router);
                let slots = Arc::clone(&self.slots);
                let batch = Arc::clone(&batch);
                tokio::spawn(run_call(router, slots, batch, index, call))
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (index, handle) in handles.into_iter().enumerate() {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_error) => {
                    warn!(index = index, error = %join_error, "Batch call task failed");
                    Err(OrchestratorError::Internal(format!(
                        "call #{index} task failed: {join_error}"
                    )))
                }
            };
            results.push(result);
        }
        abandoned.disarm();
        results
    }
}

async fn run_call(
    router: Arc<ToolRouter>,
    slots: Arc<Semaphore>,
    batch: Arc<Batch>,
    index: usize,
    call: ToolCall,
) -> Result<ToolResult> {
    let backend = call.backend.clone();
    let tool = call.tool.clone();
    let critical = call.critical;

    let result = tokio::select! {
        biased;
        _ = batch.cancel.cancelled() => Err(batch.cancelled_error()),
        permit = slots.acquire_owned() => match permit {
            Ok(_permit) => {
                tokio::select! {
                    biased;
                    _ = batch.cancel.cancelled() => Err(batch.cancelled_error()),
                    result = router.execute(call) => result,
                }
            }
            Err(_) => Err(OrchestratorError::Internal(
                "execution slot pool closed".to_string(),
            )),
        },
    };

    if let Err(error) = &result {
        let triggers = batch.policy == FailurePolicy::CancelRemaining
            && critical
            && !error.is_cancelled();
        if triggers && batch.trigger.set(index).is_ok() {
            warn!(
                index = index,
                backend = %backend,
                tool = %tool,
                error = %error,
                "Critical call failed, cancelling rest of batch"
            );
            batch.cancel.cancel();
        }
    }

    let completed = batch.completed.fetch_add(1, Ordering::SeqCst) + 1;
    if let Some(progress) = &batch.progress {
        progress(BatchProgress {
            index,
            completed,
            total: batch.total,
            backend,
            tool,
            success: result.is_ok(),
        });
    }

    result
}
