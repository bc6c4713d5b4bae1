//! Instance lifecycle state machine.
//!
//! This module defines the valid state transitions for instances and provides
//! validation logic to ensure state machine invariants are maintained.
//!
//! # State Machine
//!
//! ```text
//!  REQUESTED → VALIDATING → SCHEDULING → PROVISIONING → BOOTSTRAPPING
//!                                                            │
//!                         ┌──────────────────────────────────┤
//!                         ▼                                  ▼
//!                 CONFIGURING_NETWORK ──────────────▶ HEALTHCHECKING
//!                                                            │
//!                                                            ▼
//!        ┌──────────────────────────────────────────────  RUNNING ◀─────┐
//!        │ (stop)                                    (terminate)│        │
//!        ▼                                                      ▼        │
//!    STOPPING ──▶ STOPPED ──(start)──▶ BOOTSTRAPPING       TERMINATING   │
//!                    │                                          │        │
//!                    └────────────(terminate)──────────▶        ▼        │
//!                                                          TERMINATED    │
//!
//!  any in-flight state ──▶ ROLLING_BACK ──▶ FAILED | TERMINATED
//! ```
//!
//! `FAILED` and `TERMINATED` are terminal: nothing leaves them.

use minicloud_core::InstanceId;
use minicloud_store::InstanceState;

use crate::error::{ControlError, Result};

/// Valid next states from `state`.
#[must_use]
pub const fn allowed_transitions(state: InstanceState) -> &'static [InstanceState] {
    use InstanceState::{
        Bootstrapping, ConfiguringNetwork, Failed, Healthchecking, Provisioning, Requested,
        RollingBack, Running, Scheduling, Stopped, Stopping, Terminated, Terminating, Validating,
    };

    match state {
        Requested => &[Validating, RollingBack],
        Validating => &[Scheduling, RollingBack],
        Scheduling => &[Provisioning, RollingBack],
        Provisioning => &[Bootstrapping, RollingBack],
        // Start skips network configuration: the lease survives a stop.
        Bootstrapping => &[ConfiguringNetwork, Healthchecking, RollingBack],
        ConfiguringNetwork => &[Healthchecking, RollingBack],
        Healthchecking => &[Running, RollingBack],
        Running => &[Stopping, Terminating],
        Stopping => &[Stopped, RollingBack],
        Stopped => &[Bootstrapping, Terminating],
        Terminating => &[Terminated, RollingBack],
        RollingBack => &[Failed, Terminated],
        Failed | Terminated => &[],
    }
}

/// Check if a state transition is valid according to the state machine.
#[must_use]
pub fn is_valid_transition(from: InstanceState, to: InstanceState) -> bool {
    allowed_transitions(from).contains(&to)
}

/// Validates a state transition and returns the target state if valid.
///
/// # Errors
///
/// Returns `ControlError::InvalidState` if the transition is not allowed.
pub fn validate_transition(
    instance_id: &InstanceId,
    from: InstanceState,
    to: InstanceState,
) -> Result<InstanceState> {
    if is_valid_transition(from, to) {
        Ok(to)
    } else {
        Err(ControlError::InvalidState {
            instance_id: *instance_id,
            from,
            to,
        })
    }
}

/// Returns true if the instance can be stopped.
#[must_use]
pub const fn can_stop(state: InstanceState) -> bool {
    matches!(state, InstanceState::Running)
}

/// Returns true if the instance can be started.
#[must_use]
pub const fn can_start(state: InstanceState) -> bool {
    matches!(state, InstanceState::Stopped)
}

/// Returns true if the instance can be terminated.
#[must_use]
pub const fn can_terminate(state: InstanceState) -> bool {
    matches!(state, InstanceState::Running | InstanceState::Stopped)
}
