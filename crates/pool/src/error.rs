//! Pool-level error type.

use std::time::Duration;

use thiserror::Error;

/// Why a dispatch did not return the task's value.
///
/// Every variant except `Shutdown` retires the worker that ran the task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("task exceeded its wall-clock budget of {0:?}")]
    Timeout(Duration),

    #[error("task used {used_mb}MB, over its limit of {limit_mb}MB")]
    MemoryLimitExceeded { limit_mb: u64, used_mb: u64 },

    #[error("worker pool is shutting down")]
    Shutdown,

    /// The worker thread died or dropped the task.
    #[error("worker {0} exited before the task finished")]
    WorkerLost(usize),

    #[error("failed to start worker: {0}")]
    Spawn(String),
}
