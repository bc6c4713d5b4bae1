//! Orchestrator service implementation.
//!
//! `OrchestratorService` owns the workflow engine and turns the external
//! commands into workflow executions. It performs admission control: at most
//! one lifecycle execution runs per instance, and operations that the
//! instance's current state does not allow are rejected up front.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use minicloud_core::{ExecutionId, HostId, InstanceId};
use minicloud_scheduler::HostRegistry;
use minicloud_store::{Host, InstanceEvent, InstanceRecord, InstanceSpec, InstanceState, Store};
use minicloud_workflow::{Engine, ExecutionSnapshot, RecoveryReport};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::collaborators::{Collaborators, PolicyDecision, CREATE_INSTANCE_ACTION};
use crate::config::OrchestratorConfig;
use crate::error::{ControlError, Result};
use crate::lifecycle;
use crate::workflows::{
    register_workflows, Lifecycle, OperationInput, ProvisionInput, Transition, PROVISION, START, STOP, TERMINATE,
};

/// Events returned when the caller gives no limit.
pub const DEFAULT_EVENT_LIMIT: usize = 100;
/// Upper bound on events returned by one call.
pub const MAX_EVENT_LIMIT: usize = 1000;

/// What callers see of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceView {
    /// Instance ID.
    pub instance_id: InstanceId,
    /// Display name.
    pub name: String,
    /// Owning project.
    pub project_id: String,
    /// Current state.
    pub state: InstanceState,
    /// Host the instance is placed on.
    pub host_id: Option<HostId>,
    /// Leased address.
    pub ip_address: Option<String>,
    /// Leased DNS name.
    pub dns_name: Option<String>,
    /// Last terminal error.
    pub error_message: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
    /// When the instance was terminated.
    pub terminated_at: Option<DateTime<Utc>>,
    /// Latest lifecycle execution on the instance.
    pub execution_id: Option<ExecutionId>,
}

impl InstanceView {
    fn new(record: InstanceRecord, execution_id: Option<ExecutionId>) -> Self {
        Self {
            instance_id: record.id,
            name: record.spec.name,
            project_id: record.spec.project_id,
            state: record.state,
            host_id: record.host_id,
            ip_address: record.ip_address,
            dns_name: record.dns_name,
            error_message: record.error_message,
            created_at: record.created_at,
            updated_at: record.updated_at,
            terminated_at: record.terminated_at,
            execution_id,
        }
    }
}

/// The orchestrator: instance commands on top of the workflow engine.
pub struct OrchestratorService {
    engine: Engine,
    lifecycle: Arc<Lifecycle>,
    default_sla: Duration,
    graceful_shutdown: Duration,
    /// Latest execution per instance.
    operations: Mutex<HashMap<InstanceId, ExecutionId>>,
}

impl OrchestratorService {
    /// Wire the engine and the four instance workflows.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        hosts: Arc<HostRegistry>,
        collaborators: Collaborators,
        config: &OrchestratorConfig,
    ) -> Self {
        let lifecycle = Arc::new(Lifecycle::new(
            store.clone(),
            hosts,
            collaborators,
            config.lifecycle_settings(),
        ));
        let engine = register_workflows(Engine::builder(store).config(config.engine_config()), &lifecycle).build();

        Self {
            engine,
            lifecycle,
            default_sla: config.default_sla(),
            graceful_shutdown: config.graceful_shutdown(),
            operations: Mutex::new(HashMap::new()),
        }
    }

    /// The workflow engine.
    #[must_use]
    pub const fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The host registry.
    #[must_use]
    pub fn hosts(&self) -> &Arc<HostRegistry> {
        self.lifecycle.hosts()
    }

    // =========================================================================
    // Instance Commands
    // =========================================================================

    /// Accept a provision request and start its workflow.
    ///
    /// The instance is returned in `REQUESTED`; the workflow runs in the
    /// background. A zero `sla_timeout_seconds` means the configured default.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::PolicyDenied` if the policy gate refuses the
    /// request, or a store/engine error if it cannot be recorded.
    pub fn start_provision(&self, mut spec: InstanceSpec) -> Result<InstanceView> {
        if let PolicyDecision::Deny(reason) = self
            .lifecycle
            .collaborators()
            .policy
            .evaluate(CREATE_INSTANCE_ACTION, &spec)
        {
            warn!(project_id = %spec.project_id, reason = %reason, "Provision denied by policy");
            return Err(ControlError::PolicyDenied(reason));
        }

        if spec.sla_timeout_seconds == 0 {
            spec.sla_timeout_seconds = self.default_sla.as_secs();
        }
        let sla = Duration::from_secs(spec.sla_timeout_seconds);

        let instance_id = InstanceId::generate();
        let record = self.lifecycle.create(instance_id, spec.clone())?;
        let execution_id = ExecutionId::for_provision(&instance_id);
        let input = encode(&ProvisionInput { instance_id, spec })?;

        let mut operations = self.operations.lock();
        if let Err(e) = self.engine.start(PROVISION, execution_id.clone(), input, sla) {
            error!(%instance_id, error = %e, "Provision workflow did not start");
            self.fail_unstarted(&instance_id, &e.to_string());
            return Err(e.into());
        }
        operations.insert(instance_id, execution_id.clone());
        drop(operations);

        info!(%instance_id, %execution_id, sla_secs = sla.as_secs(), "Provision accepted");
        Ok(InstanceView::new(record, Some(execution_id)))
    }

    /// Stop a running instance.
    ///
    /// # Errors
    ///
    /// Returns `InstanceNotFound`, `OperationInProgress`, or `InvalidState`
    /// unless the instance is `RUNNING`.
    pub fn stop(&self, instance_id: &InstanceId) -> Result<ExecutionId> {
        self.begin_operation(instance_id, STOP, InstanceState::Stopping, false, self.default_sla)
    }

    /// Start a stopped instance.
    ///
    /// # Errors
    ///
    /// Returns `InstanceNotFound`, `OperationInProgress`, or `InvalidState`
    /// unless the instance is `STOPPED`.
    pub fn start(&self, instance_id: &InstanceId) -> Result<ExecutionId> {
        self.begin_operation(instance_id, START, InstanceState::Bootstrapping, false, self.default_sla)
    }

    /// Terminate an instance, skipping the graceful shutdown when `force`.
    ///
    /// # Errors
    ///
    /// Returns `InstanceNotFound`, `OperationInProgress`, or `InvalidState`
    /// unless the instance is `RUNNING` or `STOPPED`.
    pub fn terminate(&self, instance_id: &InstanceId, force: bool) -> Result<ExecutionId> {
        let sla = self.default_sla + self.graceful_shutdown;
        self.begin_operation(instance_id, TERMINATE, InstanceState::Terminating, force, sla)
    }

    /// Request cancellation of the execution running on an instance.
    ///
    /// # Errors
    ///
    /// Returns `NoOperation` if nothing was ever started on the instance, or
    /// `ExecutionCompleted` if the latest execution already finished.
    pub fn cancel(&self, instance_id: &InstanceId) -> Result<ExecutionId> {
        let execution_id = self
            .operations
            .lock()
            .get(instance_id)
            .cloned()
            .ok_or(ControlError::NoOperation(*instance_id))?;
        self.engine.cancel(&execution_id)?;
        info!(%instance_id, %execution_id, "Cancellation requested");
        Ok(execution_id)
    }

    /// Latest durable state of an instance. Never waits on a running
    /// activity.
    ///
    /// # Errors
    ///
    /// Returns `InstanceNotFound` if the instance does not exist.
    pub fn get_state(&self, instance_id: &InstanceId) -> Result<InstanceView> {
        let record = self.load(instance_id)?;
        let execution_id = self.operations.lock().get(instance_id).cloned();
        Ok(InstanceView::new(record, execution_id))
    }

    /// The newest `limit` audit events of an instance, oldest first.
    ///
    /// `limit` defaults to [`DEFAULT_EVENT_LIMIT`] and is clamped to
    /// `1..=MAX_EVENT_LIMIT`.
    ///
    /// # Errors
    ///
    /// Returns `InstanceNotFound` if the instance does not exist.
    pub fn list_events(&self, instance_id: &InstanceId, limit: Option<usize>) -> Result<Vec<InstanceEvent>> {
        self.load(instance_id)?;
        let limit = limit.unwrap_or(DEFAULT_EVENT_LIMIT).clamp(1, MAX_EVENT_LIMIT);
        Ok(self.lifecycle.store().list_events(instance_id, limit)?)
    }

    // =========================================================================
    // Executions
    // =========================================================================

    /// Deliver an agent signal to an execution.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionNotFound`, or `ExecutionCompleted` if the execution
    /// already finished.
    pub fn signal(&self, execution_id: &ExecutionId, name: &str, payload: Value) -> Result<()> {
        self.engine.signal(execution_id, name, payload)?;
        Ok(())
    }

    /// Snapshot of an execution.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionNotFound` if the execution does not exist.
    pub fn query_execution(&self, execution_id: &ExecutionId) -> Result<ExecutionSnapshot> {
        Ok(self.engine.query(execution_id)?)
    }

    /// Wait for an execution to finish.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionNotFound`, or an engine error if the execution can
    /// no longer finish in this process.
    pub async fn wait_execution(&self, execution_id: &ExecutionId) -> Result<ExecutionSnapshot> {
        Ok(self.engine.wait(execution_id).await?)
    }

    // =========================================================================
    // Hosts
    // =========================================================================

    /// Add a host or update a known one.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` for an unusable host definition.
    pub fn register_host(&self, host: Host) -> Result<Host> {
        Ok(self.lifecycle.hosts().register_host(host)?)
    }

    /// Every registered host.
    #[must_use]
    pub fn list_hosts(&self) -> Vec<Host> {
        self.lifecycle.hosts().list_hosts()
    }

    // =========================================================================
    // Operational
    // =========================================================================

    /// Resume every unfinished execution after a restart.
    ///
    /// # Errors
    ///
    /// Returns a store error if the checkpoints cannot be listed.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let report = self.engine.recover()?;
        let mut operations = self.operations.lock();
        for execution_id in &report.resumed {
            if let Some(instance_id) = execution_id.instance_id() {
                operations.insert(instance_id, execution_id.clone());
            }
        }
        Ok(report)
    }

    /// Whether the store answers.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.lifecycle.store().list_hosts().is_ok()
    }

    /// Stop every driver. Checkpoints stay for the next `recover`.
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn load(&self, instance_id: &InstanceId) -> Result<InstanceRecord> {
        self.lifecycle
            .store()
            .get_instance(instance_id)?
            .ok_or(ControlError::InstanceNotFound(*instance_id))
    }

    /// Admission control shared by stop, start and terminate.
    fn begin_operation(
        &self,
        instance_id: &InstanceId,
        workflow_type: &'static str,
        target: InstanceState,
        force: bool,
        sla: Duration,
    ) -> Result<ExecutionId> {
        let mut operations = self.operations.lock();

        if let Some(running) = operations.get(instance_id) {
            if self.engine.query(running).is_ok_and(|s| !s.is_terminal()) {
                return Err(ControlError::OperationInProgress {
                    instance_id: *instance_id,
                    execution_id: running.clone(),
                });
            }
        }

        let record = self.load(instance_id)?;
        lifecycle::validate_transition(instance_id, record.state, target)?;

        let execution_id = ExecutionId::for_operation(instance_id, workflow_type);
        let input = encode(&OperationInput {
            instance_id: *instance_id,
            force,
        })?;
        self.engine
            .start(workflow_type, execution_id.clone(), input, sla)?;
        operations.insert(*instance_id, execution_id.clone());

        info!(%instance_id, %execution_id, workflow_type, force, "Operation started");
        Ok(execution_id)
    }

    /// Best effort: an instance whose workflow never started must not be
    /// left in `REQUESTED`.
    fn fail_unstarted(&self, instance_id: &InstanceId, reason: &str) {
        let steps = [
            Transition::to(InstanceState::RollingBack, "Workflow did not start"),
            Transition::to(InstanceState::Failed, reason).with_error(reason),
        ];
        for transition in &steps {
            if let Err(e) = self.lifecycle.apply(instance_id, transition) {
                error!(%instance_id, error = %e, "Cannot mark unstarted instance failed");
                return;
            }
        }
    }
}

fn encode<T: Serialize>(input: &T) -> Result<Value> {
    serde_json::to_value(input).map_err(|e| ControlError::Internal(format!("encode workflow input: {e}")))
}
