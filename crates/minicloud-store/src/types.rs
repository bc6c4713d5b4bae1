//! Domain types stored in the database.
//!
//! These types represent the persisted state of instances, their audit log,
//! compute hosts and workflow executions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use minicloud_core::{ExecutionId, HostId, InstanceId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What the user requested. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceSpec {
    /// Human-readable name.
    pub name: String,
    /// Owning project.
    pub project_id: String,
    /// Requested virtual CPUs.
    pub cpu: u32,
    /// Requested memory in megabytes.
    pub memory_mb: u32,
    /// Requested disk in gigabytes.
    pub disk_gb: u32,
    /// Image reference, e.g. `ubuntu:22.04`.
    pub image: String,
    /// Network segment the instance is attached to.
    pub network_segment: String,
    /// Preferred availability zone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    /// Script handed to the guest on first boot.
    pub startup_script: String,
    /// Free-form labels.
    pub tags: BTreeMap<String, String>,
    /// Seconds the provision workflow may take before it is force-failed.
    pub sla_timeout_seconds: u64,
}

impl Default for InstanceSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            project_id: String::new(),
            cpu: 2,
            memory_mb: 2048,
            disk_gb: 20,
            image: "ubuntu:22.04".to_string(),
            network_segment: "default".to_string(),
            zone: None,
            startup_script: String::new(),
            tags: BTreeMap::new(),
            sla_timeout_seconds: 120,
        }
    }
}

/// Lifecycle states for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum InstanceState {
    /// Accepted, workflow not yet running.
    Requested = 1,
    /// Request is being validated.
    Validating = 2,
    /// Looking for a host.
    Scheduling = 3,
    /// Host agent is creating the VM.
    Provisioning = 4,
    /// Guest is booting.
    Bootstrapping = 5,
    /// IP and DNS are being assigned.
    ConfiguringNetwork = 6,
    /// Waiting for the guest to report healthy.
    Healthchecking = 7,
    /// Serving.
    Running = 8,
    /// Graceful stop in progress.
    Stopping = 9,
    /// Stopped, host capacity still reserved.
    Stopped = 10,
    /// Teardown in progress.
    Terminating = 11,
    /// Gone. Terminal.
    Terminated = 12,
    /// Compensating after a failure.
    RollingBack = 13,
    /// Failed. Terminal.
    Failed = 14,
}

impl InstanceState {
    /// Every state, in declaration order.
    pub const ALL: [Self; 14] = [
        Self::Requested,
        Self::Validating,
        Self::Scheduling,
        Self::Provisioning,
        Self::Bootstrapping,
        Self::ConfiguringNetwork,
        Self::Healthchecking,
        Self::Running,
        Self::Stopping,
        Self::Stopped,
        Self::Terminating,
        Self::Terminated,
        Self::RollingBack,
        Self::Failed,
    ];

    /// Convert the state to its numeric representation.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Try to convert a numeric value to an `InstanceState`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Requested),
            2 => Some(Self::Validating),
            3 => Some(Self::Scheduling),
            4 => Some(Self::Provisioning),
            5 => Some(Self::Bootstrapping),
            6 => Some(Self::ConfiguringNetwork),
            7 => Some(Self::Healthchecking),
            8 => Some(Self::Running),
            9 => Some(Self::Stopping),
            10 => Some(Self::Stopped),
            11 => Some(Self::Terminating),
            12 => Some(Self::Terminated),
            13 => Some(Self::RollingBack),
            14 => Some(Self::Failed),
            _ => None,
        }
    }

    /// Wire name of the state, e.g. `CONFIGURING_NETWORK`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "REQUESTED",
            Self::Validating => "VALIDATING",
            Self::Scheduling => "SCHEDULING",
            Self::Provisioning => "PROVISIONING",
            Self::Bootstrapping => "BOOTSTRAPPING",
            Self::ConfiguringNetwork => "CONFIGURING_NETWORK",
            Self::Healthchecking => "HEALTHCHECKING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Terminating => "TERMINATING",
            Self::Terminated => "TERMINATED",
            Self::RollingBack => "ROLLING_BACK",
            Self::Failed => "FAILED",
        }
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    /// Whether the instance counts against its project's quota.
    #[must_use]
    pub const fn counts_against_quota(self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An instance record stored in the database.
///
/// Mutated only through state-machine transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Unique identifier for the instance.
    pub id: InstanceId,
    /// Snapshot of the submitted spec.
    pub spec: InstanceSpec,
    /// Current lifecycle state.
    pub state: InstanceState,
    /// Host the instance is placed on, once scheduled.
    pub host_id: Option<HostId>,
    /// Address assigned during network configuration.
    pub ip_address: Option<String>,
    /// DNS name assigned during network configuration.
    pub dns_name: Option<String>,
    /// Last terminal error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
    /// When the instance reached `TERMINATED`.
    pub terminated_at: Option<DateTime<Utc>>,
    /// Sequence number of the last event written for this instance.
    pub event_seq: u64,
}

impl InstanceRecord {
    /// A fresh record in `REQUESTED`.
    #[must_use]
    pub fn new(id: InstanceId, spec: InstanceSpec) -> Self {
        let now = Utc::now();
        Self {
            id,
            spec,
            state: InstanceState::Requested,
            host_id: None,
            ip_address: None,
            dns_name: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            terminated_at: None,
            event_seq: 0,
        }
    }
}

/// One entry of the append-only instance audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceEvent {
    /// Instance the event belongs to.
    pub instance_id: InstanceId,
    /// Position in the instance's log, starting at 1.
    pub seq: u64,
    /// State before the transition; `None` for the creation event.
    pub from_state: Option<InstanceState>,
    /// State after the transition.
    pub to_state: InstanceState,
    /// Free-form description.
    pub message: String,
    /// When the transition was recorded.
    pub timestamp: DateTime<Utc>,
}

/// A compute host and its capacity counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Unique identifier.
    pub id: HostId,
    /// Display name.
    pub name: String,
    /// Availability zone.
    pub zone: String,
    /// Total virtual CPUs.
    pub cpu_total: u32,
    /// Virtual CPUs reserved by instances.
    pub cpu_allocated: u32,
    /// Total memory in megabytes.
    pub memory_total_mb: u32,
    /// Memory reserved by instances.
    pub memory_allocated_mb: u32,
    /// Bumped on every capacity change.
    #[serde(default)]
    pub generation: u64,
}

impl Host {
    /// An empty host with no allocations.
    #[must_use]
    pub fn new(
        id: HostId,
        name: impl Into<String>,
        zone: impl Into<String>,
        cpu_total: u32,
        memory_total_mb: u32,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            zone: zone.into(),
            cpu_total,
            cpu_allocated: 0,
            memory_total_mb,
            memory_allocated_mb: 0,
            generation: 0,
        }
    }

    /// Unreserved CPUs.
    #[must_use]
    pub const fn cpu_free(&self) -> u32 {
        self.cpu_total.saturating_sub(self.cpu_allocated)
    }

    /// Unreserved memory in megabytes.
    #[must_use]
    pub const fn memory_free_mb(&self) -> u32 {
        self.memory_total_mb.saturating_sub(self.memory_allocated_mb)
    }

    /// Whether the allocation counters are within bounds.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.cpu_allocated <= self.cpu_total && self.memory_allocated_mb <= self.memory_total_mb
    }
}

/// Capacity held on a host by one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Instance holding the capacity.
    pub instance_id: InstanceId,
    /// Host the capacity is held on.
    pub host_id: HostId,
    /// Reserved CPUs.
    pub cpu: u32,
    /// Reserved memory in megabytes.
    pub memory_mb: u32,
    /// When the reservation was made.
    pub reserved_at: DateTime<Utc>,
}

/// Where an execution is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    /// Running forward steps.
    Forward,
    /// Running the compensation path.
    Compensating,
    /// Finished successfully.
    Completed,
    /// Finished after compensation.
    Failed,
}

impl ExecutionPhase {
    /// Whether the execution has finished.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A signal delivered before the workflow asked for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSignal {
    /// Signal name, e.g. `provisioned`.
    pub name: String,
    /// Signal payload.
    pub payload: Value,
}

/// Checkpoint of one workflow execution.
///
/// Created on start, rewritten at every checkpoint, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Unique identifier.
    pub execution_id: ExecutionId,
    /// Registered workflow type name.
    pub workflow_type: String,
    /// Input the execution was started with.
    pub input: Value,
    /// Index of the next forward step to run.
    pub current_step: usize,
    /// Results of completed steps, keyed by step name.
    pub context: BTreeMap<String, Value>,
    /// Results of completed activities, signals and timers, keyed by
    /// idempotency key.
    pub memo: BTreeMap<String, Value>,
    /// Signals waiting to be consumed.
    pub pending_signals: Vec<PendingSignal>,
    /// Current phase.
    pub phase: ExecutionPhase,
    /// The error that sent the execution into compensation.
    pub failure: Option<Value>,
    /// Set by a cancel request, observed at the next suspension point.
    pub cancel_requested: bool,
    /// State exposed to queries.
    pub exposed: Value,
    /// Start timestamp.
    pub started_at: DateTime<Utc>,
    /// Absolute SLA deadline.
    pub deadline_at: DateTime<Utc>,
    /// Last checkpoint timestamp.
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    /// A fresh execution positioned at its first step.
    #[must_use]
    pub fn new(
        execution_id: ExecutionId,
        workflow_type: impl Into<String>,
        input: Value,
        sla: std::time::Duration,
    ) -> Self {
        let now = Utc::now();
        let sla = chrono::Duration::from_std(sla).unwrap_or(chrono::Duration::MAX);
        Self {
            execution_id,
            workflow_type: workflow_type.into(),
            input,
            current_step: 0,
            context: BTreeMap::new(),
            memo: BTreeMap::new(),
            pending_signals: Vec::new(),
            phase: ExecutionPhase::Forward,
            failure: None,
            cancel_requested: false,
            exposed: Value::Null,
            started_at: now,
            deadline_at: now.checked_add_signed(sla).unwrap_or(DateTime::<Utc>::MAX_UTC),
            updated_at: now,
        }
    }

    /// Whether the execution has finished.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

/// Marker for an execution that must not be resumed automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    /// The affected execution.
    pub execution_id: ExecutionId,
    /// Why it was quarantined.
    pub reason: String,
    /// When it was quarantined.
    pub quarantined_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_u8_roundtrip() {
        for state in InstanceState::ALL {
            assert_eq!(InstanceState::from_u8(state.as_u8()), Some(state));
        }
        assert_eq!(InstanceState::from_u8(0), None);
        assert_eq!(InstanceState::from_u8(15), None);
    }

    #[test]
    fn state_wire_names_match_serde() {
        for state in InstanceState::ALL {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_str()));
        }
    }

    #[test]
    fn spec_defaults() {
        let spec: InstanceSpec =
            serde_json::from_str(r#"{"name":"web","project_id":"p1"}"#).unwrap();
        assert_eq!(spec.cpu, 2);
        assert_eq!(spec.memory_mb, 2048);
        assert_eq!(spec.disk_gb, 20);
        assert_eq!(spec.image, "ubuntu:22.04");
        assert_eq!(spec.network_segment, "default");
        assert_eq!(spec.sla_timeout_seconds, 120);
    }

    #[test]
    fn host_free_capacity() {
        let mut host = Host::new("host-001".parse().unwrap(), "h1", "a", 8, 16384);
        host.cpu_allocated = 3;
        host.memory_allocated_mb = 4096;
        assert_eq!(host.cpu_free(), 5);
        assert_eq!(host.memory_free_mb(), 12288);
        assert!(host.is_consistent());
    }

    #[test]
    fn execution_deadline_follows_sla() {
        let exec = WorkflowExecution::new(
            "exec-1".parse().unwrap(),
            "provision",
            Value::Null,
            std::time::Duration::from_secs(5),
        );
        assert_eq!(exec.deadline_at - exec.started_at, chrono::Duration::seconds(5));
        assert!(!exec.is_terminal());
    }
}
