//! Provision workflow: `REQUESTED` to `RUNNING`.
//!
//! Steps, each preceded by the matching state transition:
//!
//! 1. `validate`: spec rules and project quota
//! 2. `schedule`: reserve capacity on a host
//! 3. `provision`: ask the agent to create the guest, wait for `provisioned`
//! 4. `bootstrap`: wait for the guest to start booting
//! 5. `configure_network`: lease an address and DNS name
//! 6. `health_check`: probe until healthy
//! 7. `running`: final transition and notification
//!
//! Any failure, cancellation or SLA expiry rolls back whatever was acquired
//! (lease, guest, reservation) and ends in `FAILED`.

use std::sync::Arc;

use async_trait::async_trait;
use minicloud_store::{InstanceState, Reservation};
use minicloud_workflow::{ActivityError, StepContext, Workflow, WorkflowError};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{
    missing_result, step_value, Lifecycle, ProvisionInput, ProvisionedSignal, Transition, PROVISION,
    PROVISIONED_SIGNAL, PROVISION_TIMEOUT,
};
use crate::collaborators::{AgentCommand, NetworkLease};
use crate::validation::validate_spec;

const STEPS: &[&str] = &[
    "validate",
    "schedule",
    "provision",
    "bootstrap",
    "configure_network",
    "health_check",
    "running",
];

/// Brings a requested instance up.
pub struct ProvisionWorkflow {
    lifecycle: Arc<Lifecycle>,
}

impl ProvisionWorkflow {
    /// Create the workflow.
    #[must_use]
    pub const fn new(lifecycle: Arc<Lifecycle>) -> Self {
        Self { lifecycle }
    }

    async fn validate(&self, ctx: &mut StepContext, input: &ProvisionInput) -> Result<Value, WorkflowError> {
        let instance_id = input.instance_id;
        self.lifecycle
            .transition(ctx, instance_id, Transition::to(InstanceState::Validating, "Validating request"))
            .await?;

        let lifecycle = self.lifecycle.clone();
        let spec = input.spec.clone();
        let errors: Vec<String> = ctx
            .activity("validate", move |_| {
                let lifecycle = lifecycle.clone();
                let spec = spec.clone();
                async move {
                    let active = lifecycle
                        .store()
                        .count_active_instances_by_project(&spec.project_id, Some(&instance_id))
                        .map_err(ActivityError::retryable)?;
                    Ok::<_, ActivityError>(validate_spec(&spec, active, &lifecycle.settings().rules))
                }
            })
            .await?;

        if !errors.is_empty() {
            warn!(%instance_id, ?errors, "Provision request rejected");
            return Err(WorkflowError::Validation(errors));
        }
        Ok(json!({ "valid": true }))
    }

    async fn schedule(&self, ctx: &mut StepContext, input: &ProvisionInput) -> Result<Value, WorkflowError> {
        let instance_id = input.instance_id;
        self.lifecycle
            .transition(ctx, instance_id, Transition::to(InstanceState::Scheduling, "Finding a host"))
            .await?;

        let reservation = self.lifecycle.schedule(ctx, instance_id, &input.spec).await?;
        step_value(&reservation)
    }

    async fn provision(&self, ctx: &mut StepContext, input: &ProvisionInput) -> Result<Value, WorkflowError> {
        let instance_id = input.instance_id;
        let reservation: Reservation = ctx
            .step_result("schedule")?
            .ok_or_else(|| missing_result("schedule"))?;
        let host_id = reservation.host_id;

        let transition = Transition::to(InstanceState::Provisioning, format!("Placed on host {host_id}"))
            .with_host(host_id.clone());
        self.lifecycle.transition(ctx, instance_id, transition).await?;

        self.lifecycle
            .send_command(ctx, "create_instance", host_id, instance_id, AgentCommand::create(&input.spec))
            .await?;

        let payload = ctx.wait_signal(PROVISIONED_SIGNAL).await.map_err(|e| match e {
            WorkflowError::AgentTimeout(_) => WorkflowError::AgentTimeout(PROVISION_TIMEOUT.to_string()),
            other => other,
        })?;
        let signal = serde_json::from_value::<ProvisionedSignal>(payload).unwrap_or_else(|e| {
            warn!(%instance_id, error = %e, "Malformed provisioned payload, ignoring it");
            ProvisionedSignal::default()
        });
        info!(%instance_id, ip = ?signal.ip, "Agent reported instance provisioned");
        step_value(&signal)
    }

    async fn bootstrap(&self, ctx: &mut StepContext, input: &ProvisionInput) -> Result<Value, WorkflowError> {
        let instance_id = input.instance_id;
        let provisioned: ProvisionedSignal = ctx.step_result("provision")?.unwrap_or_default();
        self.lifecycle
            .transition(ctx, instance_id, Transition::to(InstanceState::Bootstrapping, "Guest booting"))
            .await?;

        let lifecycle = self.lifecycle.clone();
        ctx.activity("readiness", move |_| {
            let lifecycle = lifecycle.clone();
            let ip = provisioned.ip.clone();
            async move {
                match lifecycle
                    .collaborators()
                    .readiness
                    .ready(&instance_id, ip.as_deref())
                    .await
                {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(ActivityError::Retryable("guest has not started booting".to_string())),
                    Err(e) => Err(e.into_activity("readiness")),
                }
            }
        })
        .await?;
        Ok(json!({ "ready": true }))
    }

    async fn configure_network(&self, ctx: &mut StepContext, input: &ProvisionInput) -> Result<Value, WorkflowError> {
        let instance_id = input.instance_id;
        self.lifecycle
            .transition(
                ctx,
                instance_id,
                Transition::to(InstanceState::ConfiguringNetwork, "Assigning network"),
            )
            .await?;

        let lease = self
            .lifecycle
            .allocate_network(ctx, instance_id, input.spec.network_segment.clone())
            .await?;
        step_value(&lease)
    }

    async fn health_check(&self, ctx: &mut StepContext, input: &ProvisionInput) -> Result<Value, WorkflowError> {
        let instance_id = input.instance_id;
        let lease: NetworkLease = ctx
            .step_result("configure_network")?
            .ok_or_else(|| missing_result("configure_network"))?;
        let provisioned: ProvisionedSignal = ctx.step_result("provision")?.unwrap_or_default();

        let transition = Transition::to(
            InstanceState::Healthchecking,
            format!("Assigned {} ({}), checking health", lease.ip_address, lease.dns_name),
        )
        .with_lease(lease.clone());
        self.lifecycle.transition(ctx, instance_id, transition).await?;

        // The agent knows the guest's real address; the lease is the fallback.
        let target = provisioned.ip.unwrap_or(lease.ip_address);
        let attempts = self.lifecycle.await_healthy(ctx, instance_id, target).await?;
        Ok(json!({ "attempts": attempts }))
    }

    async fn running(&self, ctx: &mut StepContext, input: &ProvisionInput) -> Result<Value, WorkflowError> {
        let instance_id = input.instance_id;
        let record = self
            .lifecycle
            .transition(ctx, instance_id, Transition::to(InstanceState::Running, "Instance is running"))
            .await?;

        let address = record.ip_address.as_deref().unwrap_or("no address");
        self.lifecycle
            .notify(ctx, instance_id, format!("Instance {} is running at {address}", record.spec.name))
            .await;
        Ok(json!({ "state": record.state }))
    }
}

#[async_trait]
impl Workflow for ProvisionWorkflow {
    fn workflow_type(&self) -> &'static str {
        PROVISION
    }

    fn steps(&self) -> &'static [&'static str] {
        STEPS
    }

    async fn run_step(&self, step: &str, ctx: &mut StepContext) -> Result<Value, WorkflowError> {
        let input: ProvisionInput = ctx.input()?;
        match step {
            "validate" => self.validate(ctx, &input).await,
            "schedule" => self.schedule(ctx, &input).await,
            "provision" => self.provision(ctx, &input).await,
            "bootstrap" => self.bootstrap(ctx, &input).await,
            "configure_network" => self.configure_network(ctx, &input).await,
            "health_check" => self.health_check(ctx, &input).await,
            "running" => self.running(ctx, &input).await,
            other => Err(WorkflowError::Internal(format!("unknown provision step {other}"))),
        }
    }

    async fn compensate(&self, ctx: &mut StepContext, failure: &WorkflowError) -> Result<(), WorkflowError> {
        let input: ProvisionInput = ctx.input()?;
        let instance_id = input.instance_id;
        info!(%instance_id, error = %failure, "Rolling back provision");

        self.lifecycle.begin_rollback(ctx, instance_id, failure).await?;

        // Checkpointed step results say what was acquired.
        let leased = ctx
            .step_result::<NetworkLease>("configure_network")
            .ok()
            .flatten()
            .is_some();
        let host_id = ctx
            .step_result::<Reservation>("schedule")
            .ok()
            .flatten()
            .map(|r| r.host_id);
        self.lifecycle
            .release_resources(ctx, instance_id, leased, host_id)
            .await;

        self.lifecycle
            .finish_rollback(ctx, instance_id, InstanceState::Failed, failure)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use minicloud_core::ExecutionId;
    use minicloud_store::{ExecutionPhase, InstanceState};
    use minicloud_workflow::WorkflowError;

    use crate::collaborators::mock::MockHealthProbe;
    use crate::collaborators::AgentCommand;
    use crate::workflows::testing::{spec, Harness, HOST_CPU};
    use crate::workflows::{ProvisionInput, PROVISION};

    #[tokio::test(start_paused = true)]
    async fn provisions_to_running() {
        let h = Harness::new(MockHealthProbe::healthy_on(2));
        let (id, done) = h.provision(spec("web-1")).await;

        assert_eq!(done.phase, ExecutionPhase::Completed);
        assert_eq!(
            h.states(&id),
            vec![
                InstanceState::Requested,
                InstanceState::Validating,
                InstanceState::Scheduling,
                InstanceState::Provisioning,
                InstanceState::Bootstrapping,
                InstanceState::ConfiguringNetwork,
                InstanceState::Healthchecking,
                InstanceState::Running,
            ]
        );

        let record = h.record(&id);
        assert_eq!(record.state, InstanceState::Running);
        assert_eq!(record.host_id.as_ref().map(ToString::to_string).as_deref(), Some("host-001"));
        assert!(record.ip_address.is_some());
        assert!(record.dns_name.as_deref().is_some_and(|d| d.ends_with(".minicloud.local")));
        assert!(record.error_message.is_none());

        assert_eq!(h.agent.count(|c| matches!(c, AgentCommand::CreateInstance { .. })), 1);
        assert_eq!(h.health.attempts(), 2);
        assert_eq!(h.host_allocated(), (2, 2048));
        assert_eq!(h.network.active_leases(), 1);
        assert!(h.notifier.sent().iter().any(|(_, i, m)| *i == id && m.contains("running")));
        assert_eq!(done.exposed["state"], "RUNNING");
    }

    #[tokio::test(start_paused = true)]
    async fn events_are_sequential_and_published() {
        let h = Harness::new(MockHealthProbe::healthy_on(1));
        let (id, _) = h.provision(spec("web-1")).await;

        let events = h.store.list_events(&id, 100).unwrap();
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.seq, i as u64 + 1);
        }
        for pair in events.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
            assert_eq!(pair[1].from_state, Some(pair[0].to_state));
        }
        assert_eq!(h.record(&id).event_seq, events.len() as u64);

        let published: Vec<_> = h.events.events().into_iter().map(|e| e.to_state).collect();
        assert_eq!(published, events.iter().map(|e| e.to_state).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_spec_fails_without_side_effects() {
        let h = Harness::new(MockHealthProbe::healthy_on(1));
        let mut small = spec("tiny");
        small.memory_mb = 256;
        let (id, done) = h.provision(small).await;

        assert_eq!(done.phase, ExecutionPhase::Failed);
        assert!(matches!(done.failure, Some(WorkflowError::Validation(_))));

        let record = h.record(&id);
        assert_eq!(record.state, InstanceState::Failed);
        assert!(record.error_message.unwrap().contains("Minimum memory is 512MB"));
        assert!(h.agent.requests().is_empty());
        assert_eq!(h.host_allocated(), (0, 0));
        assert!(h.hosts.reservation(&id).is_none());

        let states = h.states(&id);
        assert_eq!(&states[states.len() - 2..], &[InstanceState::RollingBack, InstanceState::Failed]);
    }

    #[tokio::test(start_paused = true)]
    async fn no_capacity_fails() {
        let h = Harness::new(MockHealthProbe::healthy_on(1));
        let mut big = spec("big");
        big.cpu = HOST_CPU;
        let (first, _) = h.provision(big.clone()).await;
        assert_eq!(h.record(&first).state, InstanceState::Running);

        let (second, done) = h.provision(big).await;
        assert!(matches!(done.failure, Some(WorkflowError::NoCapacity(_))));
        let record = h.record(&second);
        assert_eq!(record.state, InstanceState::Failed);
        assert!(record.error_message.unwrap().contains("No hosts with sufficient resources"));
        assert_eq!(h.agent.count(|c| matches!(c, AgentCommand::CreateInstance { .. })), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_agent_times_out_and_releases_capacity() {
        let h = Harness::silent_agent(MockHealthProbe::healthy_on(1));
        let mut short = spec("slow");
        short.sla_timeout_seconds = 5;
        let (id, done) = h.provision(short).await;

        assert_eq!(done.phase, ExecutionPhase::Failed);
        let record = h.record(&id);
        assert_eq!(record.state, InstanceState::Failed);
        assert_eq!(record.error_message.as_deref(), Some("Provision timeout"));

        let states = h.states(&id);
        assert_eq!(
            &states[states.len() - 3..],
            &[InstanceState::Provisioning, InstanceState::RollingBack, InstanceState::Failed]
        );
        assert!(h.hosts.reservation(&id).is_none());
        assert_eq!(h.host_allocated(), (0, 0));
        assert_eq!(h.agent.count(|c| *c == AgentCommand::DestroyInstance), 1);
        assert!(h.network.released().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_guest_rolls_back_everything() {
        let h = Harness::new(MockHealthProbe::never());
        let (id, done) = h.provision(spec("sick")).await;

        assert_eq!(done.failure, Some(WorkflowError::HealthCheckTimeout("Health check failed".into())));
        let record = h.record(&id);
        assert_eq!(record.state, InstanceState::Failed);
        assert_eq!(record.error_message.as_deref(), Some("Health check failed"));

        // 60s timeout with a 5s interval.
        assert_eq!(h.health.attempts(), 12);
        assert_eq!(h.network.released(), vec![id]);
        assert_eq!(h.network.active_leases(), 0);
        assert_eq!(h.agent.count(|c| *c == AgentCommand::DestroyInstance), 1);
        assert_eq!(h.host_allocated(), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_rolls_back() {
        let h = Harness::silent_agent(MockHealthProbe::healthy_on(1));
        let id = h.create(&spec("cancel-me"));
        let execution_id = ExecutionId::for_provision(&id);
        let input = serde_json::to_value(ProvisionInput {
            instance_id: id,
            spec: spec("cancel-me"),
        })
        .unwrap();
        h.engine
            .start(PROVISION, execution_id.clone(), input, Duration::from_secs(600))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.record(&id).state, InstanceState::Provisioning);
        h.engine.cancel(&execution_id).unwrap();

        let done = h.engine.wait(&execution_id).await.unwrap();
        assert_eq!(done.failure, Some(WorkflowError::Cancelled));
        assert_eq!(h.record(&id).state, InstanceState::Failed);
        assert!(h.hosts.reservation(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn provisioned_ip_is_probed_in_preference_to_lease() {
        let h = Harness::silent_agent(MockHealthProbe::healthy_on(1));
        let id = h.create(&spec("ip"));
        let execution_id = ExecutionId::for_provision(&id);
        let input = serde_json::to_value(ProvisionInput {
            instance_id: id,
            spec: spec("ip"),
        })
        .unwrap();
        h.engine
            .start(PROVISION, execution_id.clone(), input, Duration::from_secs(120))
            .unwrap();
        h.engine
            .signal(&execution_id, "provisioned", serde_json::json!({ "ip": "192.168.7.7" }))
            .unwrap();

        let done = h.engine.wait(&execution_id).await.unwrap();
        assert_eq!(done.phase, ExecutionPhase::Completed);
        assert!(h.health.probed_addresses().contains("192.168.7.7"));
        assert_ne!(h.record(&id).ip_address.as_deref(), Some("192.168.7.7"));
    }

    #[tokio::test(start_paused = true)]
    async fn quota_counts_other_active_instances() {
        let h = Harness::new(MockHealthProbe::healthy_on(1));
        for n in 0..50 {
            h.create(&spec(&format!("filler-{n}")));
        }
        let (id, done) = h.provision(spec("one-too-many")).await;

        assert!(matches!(done.failure, Some(WorkflowError::Validation(_))));
        assert!(h.record(&id).error_message.unwrap().contains("quota"));
    }
}
