//! The worker's error taxonomy.
//!
//! Every failure mode the core can produce is represented here so that the
//! Listener, Pool, and Beat can map it to the propagation policy described
//! in the system design: reject-without-requeue, mark-failure, retry, or
//! fatal-exit.

use crate::task::TaskId;
use thiserror::Error;

/// Errors produced anywhere in the worker core.
#[derive(Debug, Error)]
pub enum ForemanError {
    /// The message body could not be decoded with the configured codec.
    #[error("failed to decode task message: {0}")]
    Decode(String),

    /// The message named a task that is not in the registry.
    #[error("unknown task: {0}")]
    UnknownTask(String),

    /// The message decoded cleanly but violates the task message contract
    /// (missing id, malformed ETA, etc).
    #[error("invalid task message: {0}")]
    InvalidTask(String),

    /// A pool slot died without reporting a result.
    #[error("worker lost while executing task {0}")]
    WorkerLost(TaskId),

    /// The task's soft time limit elapsed; the handler may still recover.
    #[error("soft time limit exceeded for task {0}")]
    SoftTimeLimitExceeded(TaskId),

    /// The task's hard time limit elapsed; the slot was terminated.
    #[error("hard time limit exceeded for task {0}")]
    HardTimeLimitExceeded(TaskId),

    /// Handler-initiated retry: republish with an updated retry count and ETA.
    #[error("task {0} requested retry (attempt {1})")]
    Retry(TaskId, u32),

    /// The task id was present in the revocation list.
    #[error("task {0} was revoked")]
    Revoked(TaskId),

    /// The Beat loop failed to publish a due entry.
    #[error("scheduling error for periodic task {0}: {1}")]
    Scheduling(String, String),

    /// Startup-time configuration is invalid; the worker must not start.
    #[error("improperly configured: {0}")]
    ImproperlyConfigured(String),

    /// The broker connection could not be established or was lost.
    #[error("broker connection error: {0}")]
    BrokerConnection(String),
}

/// Convenience alias used across all `foreman-*` crates.
pub type ForemanResult<T> = Result<T, ForemanError>;
