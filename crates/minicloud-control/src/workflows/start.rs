//! Start workflow: `STOPPED` to `RUNNING`.
//!
//! The instance boots on the host it is still reserved on and keeps its
//! address, so network configuration is skipped.

use std::sync::Arc;

use async_trait::async_trait;
use minicloud_store::InstanceState;
use minicloud_workflow::{StepContext, Workflow, WorkflowError};
use serde_json::{json, Value};

use super::{step_value, Lifecycle, OperationInput, Transition, START};
use crate::collaborators::AgentCommand;

const STEPS: &[&str] = &["boot", "health_check", "running"];

/// Starts a stopped instance.
pub struct StartWorkflow {
    lifecycle: Arc<Lifecycle>,
}

impl StartWorkflow {
    /// Create the workflow.
    #[must_use]
    pub const fn new(lifecycle: Arc<Lifecycle>) -> Self {
        Self { lifecycle }
    }
}

#[async_trait]
impl Workflow for StartWorkflow {
    fn workflow_type(&self) -> &'static str {
        START
    }

    fn steps(&self) -> &'static [&'static str] {
        STEPS
    }

    async fn run_step(&self, step: &str, ctx: &mut StepContext) -> Result<Value, WorkflowError> {
        let input: OperationInput = ctx.input()?;
        let instance_id = input.instance_id;

        match step {
            "boot" => {
                let record = self
                    .lifecycle
                    .transition(ctx, instance_id, Transition::to(InstanceState::Bootstrapping, "Starting instance"))
                    .await?;
                let host_id = record
                    .host_id
                    .clone()
                    .ok_or_else(|| WorkflowError::Internal(format!("instance {instance_id} has no host")))?;
                self.lifecycle
                    .send_command(ctx, "start_instance", host_id, instance_id, AgentCommand::StartInstance)
                    .await?;
                step_value(&record)
            }
            "health_check" => {
                let record = self
                    .lifecycle
                    .transition(ctx, instance_id, Transition::to(InstanceState::Healthchecking, "Checking health"))
                    .await?;
                let ip_address = record
                    .ip_address
                    .ok_or_else(|| WorkflowError::Internal(format!("instance {instance_id} has no address")))?;
                let attempts = self.lifecycle.await_healthy(ctx, instance_id, ip_address).await?;
                Ok(json!({ "attempts": attempts }))
            }
            "running" => {
                let record = self
                    .lifecycle
                    .transition(ctx, instance_id, Transition::to(InstanceState::Running, "Instance is running"))
                    .await?;
                self.lifecycle
                    .notify(ctx, instance_id, format!("Instance {} is running again", record.spec.name))
                    .await;
                Ok(json!({ "state": record.state }))
            }
            other => Err(WorkflowError::Internal(format!("unknown start step {other}"))),
        }
    }

    async fn compensate(&self, ctx: &mut StepContext, failure: &WorkflowError) -> Result<(), WorkflowError> {
        self.lifecycle
            .roll_back_operation(ctx, InstanceState::Failed, failure)
            .await
    }
}

#[cfg(test)]
mod tests {
    use minicloud_store::{ExecutionPhase, InstanceState};
    use minicloud_workflow::WorkflowError;

    use crate::collaborators::mock::MockHealthProbe;
    use crate::collaborators::AgentCommand;
    use crate::workflows::testing::{spec, Harness};
    use crate::workflows::{START, STOP};

    #[tokio::test(start_paused = true)]
    async fn start_after_stop_returns_to_running() {
        let h = Harness::new(MockHealthProbe::healthy_on(1));
        let (id, _) = h.provision(spec("web-1")).await;
        let address = h.record(&id).ip_address;
        h.run(STOP, id, false).await;

        let done = h.run(START, id, false).await;
        assert_eq!(done.phase, ExecutionPhase::Completed);

        let record = h.record(&id);
        assert_eq!(record.state, InstanceState::Running);
        assert_eq!(record.ip_address, address);
        assert_eq!(h.agent.count(|c| *c == AgentCommand::StartInstance), 1);
        assert!(h.health.probed_addresses().contains(address.as_deref().unwrap()));

        let states = h.states(&id);
        assert_eq!(
            &states[states.len() - 3..],
            &[InstanceState::Bootstrapping, InstanceState::Healthchecking, InstanceState::Running]
        );
        // One reservation for the whole life of the instance.
        assert_eq!(h.host_allocated(), (2, 2048));
    }

    #[tokio::test(start_paused = true)]
    async fn start_of_running_instance_changes_nothing() {
        let h = Harness::new(MockHealthProbe::healthy_on(1));
        let (id, _) = h.provision(spec("web-1")).await;
        let seq = h.record(&id).event_seq;

        let done = h.run(START, id, false).await;
        assert_eq!(done.phase, ExecutionPhase::Failed);
        assert!(matches!(done.failure, Some(WorkflowError::Internal(_))));
        assert_eq!(h.record(&id).state, InstanceState::Running);
        assert_eq!(h.record(&id).event_seq, seq);
    }
}
