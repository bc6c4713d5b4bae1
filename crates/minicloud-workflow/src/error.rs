//! Error types for the workflow engine.
//!
//! Two families live here:
//!
//! - [`EngineError`] is returned by the engine's own API (`start`, `signal`,
//!   `query`, ...) and never reaches workflow logic.
//! - [`WorkflowError`] is what a workflow step fails with. It is persisted in
//!   the checkpoint when an execution enters compensation, so it is
//!   serde-serializable.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A result type using `EngineError`.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors returned by the engine API.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No execution with this ID exists.
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    /// The execution has already finished.
    #[error("execution already completed: {0}")]
    ExecutionCompleted(String),

    /// The execution exists but no driver is running it.
    #[error("execution not running: {0}")]
    NotRunning(String),

    /// No workflow is registered under this type name.
    #[error("unknown workflow type: {0}")]
    UnknownWorkflow(String),

    /// The checkpoint cannot be resumed safely.
    #[error("checkpoint corruption in {execution_id}: {reason}")]
    CheckpointCorruption {
        /// The affected execution.
        execution_id: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The engine was shut down while the caller was waiting.
    #[error("engine shut down")]
    Shutdown,

    /// A value could not be converted to or from JSON.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] minicloud_store::StoreError),
}

/// Failures visible to workflow logic.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum WorkflowError {
    /// The request was rejected; every violation is listed.
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// No host can take the instance.
    #[error("{0}")]
    NoCapacity(String),

    /// The agent did not respond in time, or the SLA deadline passed.
    #[error("{0}")]
    AgentTimeout(String),

    /// The instance never reported healthy.
    #[error("{0}")]
    HealthCheckTimeout(String),

    /// Network allocation or release failed.
    #[error("Network configuration failed: {0}")]
    Network(String),

    /// An activity failed permanently or ran out of retries.
    #[error("{activity} failed: {message}")]
    ActivityFailed {
        /// Activity name.
        activity: String,
        /// Last error reported by the activity.
        message: String,
    },

    /// The execution was cancelled.
    #[error("Cancelled")]
    Cancelled,

    /// Cleanup during compensation failed.
    #[error("Rollback failed: {0}")]
    Rollback(String),

    /// The checkpoint cannot be resumed safely.
    #[error("Checkpoint corruption: {0}")]
    CheckpointCorruption(String),

    /// The checkpoint could not be written.
    #[error("Store error: {0}")]
    Store(String),

    /// An invariant was violated.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl WorkflowError {
    /// Message suitable for `error_message` on the instance record.
    #[must_use]
    pub fn user_message(&self) -> String {
        self.to_string()
    }

    /// Convenience constructor for `ActivityFailed`.
    #[must_use]
    pub fn activity_failed(activity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ActivityFailed {
            activity: activity.into(),
            message: message.into(),
        }
    }
}

impl From<EngineError> for WorkflowError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Store(e) => Self::Store(e.to_string()),
            EngineError::CheckpointCorruption { reason, .. } => Self::CheckpointCorruption(reason),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Outcome of one failed activity attempt.
#[derive(Debug, Clone, Error)]
pub enum ActivityError {
    /// Transient; retried per the retry policy.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Permanent; surfaced to the workflow immediately.
    #[error("fatal: {0}")]
    Fatal(WorkflowError),
}

impl ActivityError {
    /// Build a retryable error from anything displayable.
    pub fn retryable(err: impl std::fmt::Display) -> Self {
        Self::Retryable(err.to_string())
    }
}

impl From<WorkflowError> for ActivityError {
    fn from(err: WorkflowError) -> Self {
        Self::Fatal(err)
    }
}
