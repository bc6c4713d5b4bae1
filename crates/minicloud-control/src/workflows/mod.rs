//! Instance workflows.
//!
//! Four workflow definitions drive an instance through the lifecycle state
//! machine on top of the workflow engine:
//!
//! - [`ProvisionWorkflow`]: `REQUESTED` to `RUNNING`
//! - [`StopWorkflow`]: `RUNNING` to `STOPPED`
//! - [`StartWorkflow`]: `STOPPED` to `RUNNING`
//! - [`TerminateWorkflow`]: `RUNNING`/`STOPPED` to `TERMINATED`
//!
//! Everything that touches the outside world (the store, the host registry,
//! the agent, the network) runs as an engine activity through [`Lifecycle`],
//! so every side effect is checkpointed and never repeated on replay.

pub mod provision;
pub mod start;
pub mod stop;
pub mod terminate;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use minicloud_core::{HostId, InstanceId};
use minicloud_scheduler::{HostRegistry, SchedulerError};
use minicloud_store::{InstanceEvent, InstanceRecord, InstanceSpec, InstanceState, Reservation, Store};
use minicloud_workflow::{ActivityError, EngineBuilder, RetryPolicy, StepContext, WorkflowError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::collaborators::{AgentCommand, AgentRequest, Collaborators, InstanceStateChanged, NetworkLease};
use crate::error::CollaboratorError;
use crate::lifecycle;
use crate::validation::ValidationRules;

pub use provision::ProvisionWorkflow;
pub use start::StartWorkflow;
pub use stop::StopWorkflow;
pub use terminate::TerminateWorkflow;

/// Workflow type of the provision workflow.
pub const PROVISION: &str = "provision";
/// Workflow type of the stop workflow.
pub const STOP: &str = "stop";
/// Workflow type of the start workflow.
pub const START: &str = "start";
/// Workflow type of the terminate workflow.
pub const TERMINATE: &str = "terminate";

/// Signal the agent sends once the VM or container exists.
pub const PROVISIONED_SIGNAL: &str = "provisioned";
/// Signal the agent sends once a graceful shutdown has finished.
pub const SHUTDOWN_COMPLETE_SIGNAL: &str = "shutdown_complete";

/// Error message when the agent never reports `provisioned`.
pub const PROVISION_TIMEOUT: &str = "Provision timeout";
/// Error message when the guest never reports healthy.
pub const HEALTH_CHECK_FAILED: &str = "Health check failed";

/// Channel lifecycle notifications are sent on.
pub const NOTIFICATION_CHANNEL: &str = "instance-lifecycle";

/// Input of the provision workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionInput {
    /// Instance being provisioned.
    pub instance_id: InstanceId,
    /// Spec as submitted.
    pub spec: InstanceSpec,
}

/// Input of the stop, start and terminate workflows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationInput {
    /// Target instance.
    pub instance_id: InstanceId,
    /// Terminate only: skip the graceful shutdown wait.
    #[serde(default)]
    pub force: bool,
}

/// Payload of the `provisioned` signal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedSignal {
    /// Address the agent reports for the guest.
    #[serde(default)]
    pub ip: Option<String>,
    /// Boot output captured by the agent.
    #[serde(default, alias = "bootLogs")]
    pub boot_logs: Option<String>,
}

/// Timing and limits used by the workflows.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Rules checked by the provision workflow's validate step.
    pub rules: ValidationRules,
    /// Total time the guest has to report healthy.
    pub health_check_timeout: Duration,
    /// Pause between health probes.
    pub health_check_interval: Duration,
    /// How long terminate waits for a graceful shutdown.
    pub graceful_shutdown: Duration,
}

impl LifecycleSettings {
    /// Number of health probes: `ceil(timeout / interval)`, at least one.
    #[must_use]
    pub fn health_check_attempts(&self) -> u32 {
        let interval = self.health_check_interval.as_secs().max(1);
        let attempts = self.health_check_timeout.as_secs().div_ceil(interval).max(1);
        u32::try_from(attempts).unwrap_or(u32::MAX)
    }
}

/// A state change to apply to an instance record.
#[derive(Debug, Clone)]
pub struct Transition {
    to: InstanceState,
    message: String,
    host_id: Option<HostId>,
    lease: Option<NetworkLease>,
    error_message: Option<String>,
    only_if_allowed: bool,
}

impl Transition {
    /// Move to `to`, logging `message` in the audit trail.
    #[must_use]
    pub fn to(to: InstanceState, message: impl Into<String>) -> Self {
        Self {
            to,
            message: message.into(),
            host_id: None,
            lease: None,
            error_message: None,
            only_if_allowed: false,
        }
    }

    /// Record the host the instance was placed on.
    #[must_use]
    pub fn with_host(mut self, host_id: HostId) -> Self {
        self.host_id = Some(host_id);
        self
    }

    /// Record the instance's network addresses.
    #[must_use]
    pub fn with_lease(mut self, lease: NetworkLease) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Record a terminal error message.
    #[must_use]
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Leave the record untouched, instead of failing, when the transition
    /// is not allowed from its current state.
    #[must_use]
    pub const fn if_allowed(mut self) -> Self {
        self.only_if_allowed = true;
        self
    }
}

/// Everything the instance workflows act on.
pub struct Lifecycle {
    store: Arc<dyn Store>,
    hosts: Arc<HostRegistry>,
    collaborators: Collaborators,
    settings: LifecycleSettings,
}

impl Lifecycle {
    /// Wire the workflows' dependencies.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        hosts: Arc<HostRegistry>,
        collaborators: Collaborators,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            store,
            hosts,
            collaborators,
            settings,
        }
    }

    /// The instance store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The host registry.
    #[must_use]
    pub fn hosts(&self) -> &Arc<HostRegistry> {
        &self.hosts
    }

    /// The collaborators.
    #[must_use]
    pub const fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// The timing and limits.
    #[must_use]
    pub const fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    /// Persist a new record in `REQUESTED` together with its creation event.
    ///
    /// # Errors
    ///
    /// Returns a store error if the record cannot be written.
    pub fn create(&self, instance_id: InstanceId, spec: InstanceSpec) -> minicloud_store::Result<InstanceRecord> {
        let mut record = InstanceRecord::new(instance_id, spec);
        record.event_seq = 1;
        let event = InstanceEvent {
            instance_id,
            seq: 1,
            from_state: None,
            to_state: InstanceState::Requested,
            message: format!("Instance {} requested", record.spec.name),
            timestamp: record.created_at,
        };
        self.store.record_transition(&record, &event)?;
        info!(%instance_id, project_id = %record.spec.project_id, "Instance requested");
        self.collaborators
            .events
            .publish(&InstanceStateChanged::from_transition(&record, &event));
        Ok(record)
    }

    /// Apply `transition` to the stored record, writing the record and its
    /// audit event in one batch.
    ///
    /// A record already in the target state is returned unchanged, so a
    /// replayed transition writes nothing.
    ///
    /// # Errors
    ///
    /// Store failures are retryable. A missing record or a transition the
    /// state machine forbids is fatal.
    pub fn apply(&self, instance_id: &InstanceId, transition: &Transition) -> Result<InstanceRecord, ActivityError> {
        let mut record = self
            .store
            .get_instance(instance_id)
            .map_err(ActivityError::retryable)?
            .ok_or_else(|| WorkflowError::Internal(format!("instance {instance_id} not found")))?;

        let from = record.state;
        if from == transition.to {
            debug!(%instance_id, state = %from, "Transition already applied");
            return Ok(record);
        }
        if transition.only_if_allowed && !lifecycle::is_valid_transition(from, transition.to) {
            debug!(%instance_id, from = %from, to = %transition.to, "Transition not applicable");
            return Ok(record);
        }
        lifecycle::validate_transition(instance_id, from, transition.to)
            .map_err(|e| WorkflowError::Internal(e.to_string()))?;

        // Strictly increasing per instance, even if the clock steps back.
        let timestamp = Utc::now().max(record.updated_at + chrono::Duration::microseconds(1));
        record.state = transition.to;
        record.updated_at = timestamp;
        record.event_seq += 1;
        if let Some(host_id) = &transition.host_id {
            record.host_id = Some(host_id.clone());
        }
        if let Some(lease) = &transition.lease {
            record.ip_address = Some(lease.ip_address.clone());
            record.dns_name = Some(lease.dns_name.clone());
        }
        if let Some(message) = &transition.error_message {
            record.error_message = Some(message.clone());
        }
        if transition.to == InstanceState::Terminated {
            record.terminated_at = Some(timestamp);
        }

        let event = InstanceEvent {
            instance_id: *instance_id,
            seq: record.event_seq,
            from_state: Some(from),
            to_state: transition.to,
            message: transition.message.clone(),
            timestamp,
        };
        self.store
            .record_transition(&record, &event)
            .map_err(ActivityError::retryable)?;

        info!(
            %instance_id,
            from = %from,
            to = %transition.to,
            message = %transition.message,
            "Instance state changed"
        );
        self.collaborators
            .events
            .publish(&InstanceStateChanged::from_transition(&record, &event));
        Ok(record)
    }

    // =========================================================================
    // Activities
    // =========================================================================

    /// Apply a transition as an activity and expose the new state.
    pub(crate) async fn transition(
        self: &Arc<Self>,
        ctx: &mut StepContext,
        instance_id: InstanceId,
        transition: Transition,
    ) -> Result<InstanceRecord, WorkflowError> {
        let name = format!("transition to {}", transition.to);
        let lifecycle = self.clone();
        let record: InstanceRecord = ctx
            .activity(&name, move |_| {
                let lifecycle = lifecycle.clone();
                let transition = transition.clone();
                async move { lifecycle.apply(&instance_id, &transition) }
            })
            .await?;

        ctx.expose(&json!({
            "instance_id": record.id,
            "state": record.state,
            "host_id": record.host_id,
            "ip_address": record.ip_address,
        }));
        Ok(record)
    }

    /// Send a command to the agent on `host_id`.
    pub(crate) async fn send_command(
        self: &Arc<Self>,
        ctx: &mut StepContext,
        activity: &'static str,
        host_id: HostId,
        instance_id: InstanceId,
        command: AgentCommand,
    ) -> Result<(), WorkflowError> {
        let lifecycle = self.clone();
        let execution_id = ctx.execution_id().clone();
        ctx.activity(activity, move |actx| {
            let lifecycle = lifecycle.clone();
            let host_id = host_id.clone();
            let request = AgentRequest::new(&actx.idempotency_key, &execution_id, instance_id, command.clone());
            async move {
                lifecycle
                    .collaborators
                    .agent
                    .send(&host_id, &request)
                    .await
                    .map_err(|e| e.into_activity(activity))
            }
        })
        .await
    }

    /// Probe the guest until it reports healthy, sleeping the configured
    /// interval between probes. Returns the successful attempt number.
    pub(crate) async fn await_healthy(
        self: &Arc<Self>,
        ctx: &mut StepContext,
        instance_id: InstanceId,
        ip_address: String,
    ) -> Result<u32, WorkflowError> {
        let attempts = self.settings.health_check_attempts();

        for attempt in 1..=attempts {
            let lifecycle = self.clone();
            let ip = ip_address.clone();
            let healthy: bool = ctx
                .activity_with_policy("health_probe", &RetryPolicy::none(), move |_| {
                    let lifecycle = lifecycle.clone();
                    let ip = ip.clone();
                    async move {
                        let healthy = match lifecycle.collaborators.health.probe(&instance_id, &ip).await {
                            Ok(healthy) => healthy,
                            Err(e) => {
                                debug!(%instance_id, error = %e, "Health probe failed");
                                false
                            }
                        };
                        Ok::<_, ActivityError>(healthy)
                    }
                })
                .await?;

            if healthy {
                info!(%instance_id, attempt, "Instance healthy");
                return Ok(attempt);
            }
            if attempt < attempts {
                ctx.sleep(self.settings.health_check_interval).await?;
            }
        }

        warn!(%instance_id, attempts, "Instance never reported healthy");
        Err(WorkflowError::HealthCheckTimeout(HEALTH_CHECK_FAILED.to_string()))
    }

    /// Assign network addresses to the instance.
    pub(crate) async fn allocate_network(
        self: &Arc<Self>,
        ctx: &mut StepContext,
        instance_id: InstanceId,
        segment: String,
    ) -> Result<NetworkLease, WorkflowError> {
        let lifecycle = self.clone();
        ctx.activity("allocate_network", move |_| {
            let lifecycle = lifecycle.clone();
            let segment = segment.clone();
            async move {
                lifecycle
                    .collaborators
                    .network
                    .allocate(&instance_id, &segment)
                    .await
                    .map_err(network_error)
            }
        })
        .await
    }

    /// Return the instance's addresses to the pool.
    pub(crate) async fn release_network(
        self: &Arc<Self>,
        ctx: &mut StepContext,
        instance_id: InstanceId,
    ) -> Result<(), WorkflowError> {
        let lifecycle = self.clone();
        ctx.activity("release_network", move |_| {
            let lifecycle = lifecycle.clone();
            async move {
                lifecycle
                    .collaborators
                    .network
                    .release(&instance_id)
                    .await
                    .map_err(network_error)
            }
        })
        .await
    }

    /// Reserve host capacity for the instance.
    pub(crate) async fn schedule(
        self: &Arc<Self>,
        ctx: &mut StepContext,
        instance_id: InstanceId,
        spec: &InstanceSpec,
    ) -> Result<Reservation, WorkflowError> {
        let lifecycle = self.clone();
        let request = minicloud_scheduler::ResourceRequest::from(spec);
        ctx.activity("schedule", move |_| {
            let lifecycle = lifecycle.clone();
            let request = request.clone();
            async move {
                lifecycle
                    .hosts
                    .schedule(instance_id, &request)
                    .map_err(scheduler_error)
            }
        })
        .await
    }

    /// Return the instance's reserved capacity to its host.
    pub(crate) async fn release_host(
        self: &Arc<Self>,
        ctx: &mut StepContext,
        instance_id: InstanceId,
    ) -> Result<Option<Reservation>, WorkflowError> {
        let lifecycle = self.clone();
        ctx.activity("release_host", move |_| {
            let lifecycle = lifecycle.clone();
            async move { lifecycle.hosts.release(&instance_id).map_err(scheduler_error) }
        })
        .await
    }

    /// Send a best-effort notification. Failures are logged only.
    pub(crate) async fn notify(self: &Arc<Self>, ctx: &mut StepContext, instance_id: InstanceId, message: String) {
        let lifecycle = self.clone();
        let result = ctx
            .activity_with_policy("notify", &RetryPolicy::none(), move |_| {
                let lifecycle = lifecycle.clone();
                let message = message.clone();
                async move {
                    lifecycle
                        .collaborators
                        .notifier
                        .notify(NOTIFICATION_CHANNEL, &instance_id, &message);
                    Ok::<_, ActivityError>(())
                }
            })
            .await;

        if let Err(e) = result {
            warn!(%instance_id, error = %e, "Notification not sent");
        }
    }

    // =========================================================================
    // Rollback
    // =========================================================================

    /// Move the instance into `ROLLING_BACK` if its current state allows it.
    pub(crate) async fn begin_rollback(
        self: &Arc<Self>,
        ctx: &mut StepContext,
        instance_id: InstanceId,
        failure: &WorkflowError,
    ) -> Result<InstanceRecord, WorkflowError> {
        let transition = Transition::to(InstanceState::RollingBack, format!("Rolling back: {failure}")).if_allowed();
        self.transition(ctx, instance_id, transition).await
    }

    /// Undo, in reverse order, whatever the instance holds: network lease,
    /// guest on its host, host reservation. Every step is best-effort.
    pub(crate) async fn release_resources(
        self: &Arc<Self>,
        ctx: &mut StepContext,
        instance_id: InstanceId,
        network: bool,
        host_id: Option<HostId>,
    ) {
        if network {
            let result = self.release_network(ctx, instance_id).await;
            log_rollback_failure(&instance_id, "release_network", result);
        }
        if let Some(host_id) = host_id {
            let result = self
                .send_command(ctx, "destroy_instance", host_id, instance_id, AgentCommand::DestroyInstance)
                .await;
            log_rollback_failure(&instance_id, "destroy_instance", result);

            let result = self.release_host(ctx, instance_id).await;
            log_rollback_failure(&instance_id, "release_host", result);
        }
    }

    /// Final transition of a rollback, recording the failure on the record.
    pub(crate) async fn finish_rollback(
        self: &Arc<Self>,
        ctx: &mut StepContext,
        instance_id: InstanceId,
        final_state: InstanceState,
        failure: &WorkflowError,
    ) -> Result<InstanceRecord, WorkflowError> {
        let error_message = failure.user_message();
        let message = match final_state {
            InstanceState::Terminated => format!("Terminated after failed teardown: {error_message}"),
            _ => error_message.clone(),
        };
        let record = self
            .transition(ctx, instance_id, Transition::to(final_state, message).with_error(error_message.clone()))
            .await?;
        self.notify(
            ctx,
            instance_id,
            format!("Instance {} is {}: {error_message}", record.spec.name, record.state),
        )
        .await;
        Ok(record)
    }

    /// Compensation shared by stop, start and terminate.
    ///
    /// If the operation never moved the instance out of its starting state
    /// there is nothing to undo and the instance is left as it was.
    /// Otherwise every held resource is released and the instance ends in
    /// `final_state`.
    pub(crate) async fn roll_back_operation(
        self: &Arc<Self>,
        ctx: &mut StepContext,
        final_state: InstanceState,
        failure: &WorkflowError,
    ) -> Result<(), WorkflowError> {
        let input: OperationInput = ctx.input()?;
        let instance_id = input.instance_id;

        let record = self.begin_rollback(ctx, instance_id, failure).await?;
        if record.state != InstanceState::RollingBack {
            info!(%instance_id, state = %record.state, "Nothing to roll back");
            return Ok(());
        }

        self.release_resources(ctx, instance_id, true, record.host_id.clone())
            .await;
        self.finish_rollback(ctx, instance_id, final_state, failure)
            .await?;
        Ok(())
    }
}

/// Register the four instance workflows with an engine.
#[must_use]
pub fn register_workflows(builder: EngineBuilder, lifecycle: &Arc<Lifecycle>) -> EngineBuilder {
    builder
        .register(Arc::new(ProvisionWorkflow::new(lifecycle.clone())))
        .register(Arc::new(StopWorkflow::new(lifecycle.clone())))
        .register(Arc::new(StartWorkflow::new(lifecycle.clone())))
        .register(Arc::new(TerminateWorkflow::new(lifecycle.clone())))
}

/// Encode a step result for the checkpoint.
pub(crate) fn step_value<T: Serialize>(value: &T) -> Result<Value, WorkflowError> {
    serde_json::to_value(value).map_err(|e| WorkflowError::Internal(format!("encode step result: {e}")))
}

/// Error for a step whose predecessor's result is missing.
pub(crate) fn missing_result(step: &str) -> WorkflowError {
    WorkflowError::CheckpointCorruption(format!("no recorded result for step {step}"))
}

fn network_error(err: CollaboratorError) -> ActivityError {
    match err {
        CollaboratorError::Transient(msg) => ActivityError::Retryable(msg),
        CollaboratorError::Permanent(msg) => ActivityError::Fatal(WorkflowError::Network(msg)),
    }
}

fn scheduler_error(err: SchedulerError) -> ActivityError {
    match err {
        SchedulerError::NoCapacity { .. } => ActivityError::Fatal(WorkflowError::NoCapacity(err.to_string())),
        SchedulerError::Store(e) => ActivityError::retryable(e),
        other => ActivityError::Fatal(WorkflowError::Internal(other.to_string())),
    }
}

fn log_rollback_failure<T>(instance_id: &InstanceId, activity: &str, result: Result<T, WorkflowError>) {
    if let Err(e) = result {
        error!(
            %instance_id,
            activity,
            error = %WorkflowError::Rollback(e.to_string()),
            "Rollback step failed; operator follow-up required"
        );
    }
}

#[cfg(test)]
pub(crate) mod testing;
