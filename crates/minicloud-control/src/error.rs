//! Error types for the orchestrator.
//!
//! This module defines all errors that can occur while accepting and
//! driving instance lifecycle operations, plus the error type shared by the
//! external collaborators (agent, network, probes).

use minicloud_core::{ExecutionId, HostId, InstanceId};
use minicloud_scheduler::SchedulerError;
use minicloud_store::InstanceState;
use minicloud_workflow::{ActivityError, EngineError, WorkflowError};
use thiserror::Error;

/// A result type using `ControlError`.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Errors that can occur in orchestrator operations.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The requested instance was not found.
    #[error("instance not found: {0}")]
    InstanceNotFound(InstanceId),

    /// The requested execution was not found.
    #[error("execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    /// The requested host was not found.
    #[error("host not found: {0}")]
    HostNotFound(HostId),

    /// The operation is not allowed from the instance's current state.
    #[error("invalid state transition for instance {instance_id}: cannot transition from {from} to {to}")]
    InvalidState {
        /// The instance being transitioned.
        instance_id: InstanceId,
        /// The current state.
        from: InstanceState,
        /// The requested target state.
        to: InstanceState,
    },

    /// Another lifecycle operation is still running on the instance.
    #[error("operation {execution_id} already in progress for instance {instance_id}")]
    OperationInProgress {
        /// The instance.
        instance_id: InstanceId,
        /// The execution holding the instance.
        execution_id: ExecutionId,
    },

    /// The execution has already finished.
    #[error("execution already completed: {0}")]
    ExecutionCompleted(ExecutionId),

    /// No lifecycle operation is running on the instance.
    #[error("no operation in progress for instance {0}")]
    NoOperation(InstanceId),

    /// The policy gate rejected the request.
    #[error("request denied by policy: {0}")]
    PolicyDenied(String),

    /// No host has enough free capacity.
    #[error("{0}")]
    NoCapacity(String),

    /// The request could not be parsed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Storage layer error.
    #[error("storage error: {0}")]
    Store(#[from] minicloud_store::StoreError),

    /// Workflow engine error.
    #[error("engine error: {0}")]
    Engine(EngineError),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Returns the appropriate HTTP status code for this error.
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::InstanceNotFound(_) | Self::ExecutionNotFound(_) | Self::HostNotFound(_) => 404,
            Self::InvalidState { .. }
            | Self::OperationInProgress { .. }
            | Self::ExecutionCompleted(_)
            | Self::NoOperation(_) => 409,
            Self::PolicyDenied(_) => 403,
            Self::NoCapacity(_) => 503,
            Self::BadRequest(_) => 400,
            Self::Store(_) | Self::Engine(_) | Self::Internal(_) => 500,
        }
    }

    /// Returns true if this error might be resolved by retrying.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::Internal(_) | Self::NoCapacity(_) | Self::OperationInProgress { .. }
        )
    }
}

impl From<SchedulerError> for ControlError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::NoCapacity { .. } => Self::NoCapacity(err.to_string()),
            SchedulerError::HostNotFound(id) => Self::HostNotFound(id),
            SchedulerError::InvalidHost(msg) => Self::BadRequest(msg),
            SchedulerError::Store(e) => Self::Store(e),
        }
    }
}

impl From<EngineError> for ControlError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::ExecutionNotFound(id) => id
                .parse()
                .map_or_else(|_| Self::Internal(format!("malformed execution id {id}")), Self::ExecutionNotFound),
            EngineError::ExecutionCompleted(id) => id
                .parse()
                .map_or_else(|_| Self::Internal(format!("malformed execution id {id}")), Self::ExecutionCompleted),
            EngineError::Store(e) => Self::Store(e),
            other => Self::Engine(other),
        }
    }
}

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, Error)]
pub enum CollaboratorError {
    /// Worth retrying: connection failures, timeouts, 5xx responses.
    #[error("transient: {0}")]
    Transient(String),

    /// Retrying will not help: the collaborator rejected the request.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl CollaboratorError {
    /// Convert into an activity error. Permanent failures surface to the
    /// workflow as `ActivityFailed` attributed to `activity`.
    #[must_use]
    pub fn into_activity(self, activity: &str) -> ActivityError {
        match self {
            Self::Transient(msg) => ActivityError::Retryable(msg),
            Self::Permanent(msg) => ActivityError::Fatal(WorkflowError::activity_failed(activity, msg)),
        }
    }
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() || err.is_decode() {
            Self::Permanent(err.to_string())
        } else {
            Self::Transient(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_status_codes() {
        let instance_id = InstanceId::generate();
        let execution_id = ExecutionId::for_provision(&instance_id);

        assert_eq!(ControlError::InstanceNotFound(instance_id).http_status_code(), 404);
        assert_eq!(
            ControlError::InvalidState {
                instance_id,
                from: InstanceState::Terminated,
                to: InstanceState::Stopping,
            }
            .http_status_code(),
            409
        );
        assert_eq!(
            ControlError::OperationInProgress {
                instance_id,
                execution_id
            }
            .http_status_code(),
            409
        );
        assert_eq!(ControlError::PolicyDenied("no".into()).http_status_code(), 403);
        assert_eq!(ControlError::NoCapacity("full".into()).http_status_code(), 503);
        assert_eq!(ControlError::Internal("x".into()).http_status_code(), 500);
    }

    #[test]
    fn engine_errors_keep_their_meaning() {
        let err = ControlError::from(EngineError::ExecutionCompleted("exec-1".into()));
        assert!(matches!(err, ControlError::ExecutionCompleted(id) if id.as_str() == "exec-1"));

        let err = ControlError::from(EngineError::ExecutionNotFound("exec-2".into()));
        assert_eq!(err.http_status_code(), 404);
    }

    #[test]
    fn collaborator_errors_map_to_activity_errors() {
        assert!(matches!(
            CollaboratorError::Transient("reset".into()).into_activity("provision"),
            ActivityError::Retryable(_)
        ));
        assert!(matches!(
            CollaboratorError::Permanent("bad image".into()).into_activity("provision"),
            ActivityError::Fatal(WorkflowError::ActivityFailed { activity, .. }) if activity == "provision"
        ));
    }
}
