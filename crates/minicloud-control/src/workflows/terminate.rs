//! Terminate workflow: `RUNNING` or `STOPPED` to `TERMINATED`.
//!
//! Unless forced, the guest is first asked to shut down and given the
//! configured grace period to report `shutdown_complete`. Teardown then
//! destroys the guest and releases the lease and the host reservation.
//! A failed teardown still ends in `TERMINATED`, with the failure recorded.

use std::sync::Arc;

use async_trait::async_trait;
use minicloud_core::InstanceId;
use minicloud_store::{InstanceRecord, InstanceState};
use minicloud_workflow::{StepContext, Workflow, WorkflowError};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{
    missing_result, step_value, Lifecycle, OperationInput, Transition, SHUTDOWN_COMPLETE_SIGNAL, TERMINATE,
};
use crate::collaborators::AgentCommand;

const STEPS: &[&str] = &["terminating", "shutdown", "destroy", "terminated"];

/// Tears an instance down for good.
pub struct TerminateWorkflow {
    lifecycle: Arc<Lifecycle>,
}

impl TerminateWorkflow {
    /// Create the workflow.
    #[must_use]
    pub const fn new(lifecycle: Arc<Lifecycle>) -> Self {
        Self { lifecycle }
    }

    async fn shutdown(
        &self,
        ctx: &mut StepContext,
        input: &OperationInput,
        record: &InstanceRecord,
    ) -> Result<Value, WorkflowError> {
        let instance_id = input.instance_id;
        if input.force {
            info!(%instance_id, "Forced termination, skipping graceful shutdown");
            return Ok(json!({ "graceful": false }));
        }
        let Some(host_id) = record.host_id.clone() else {
            return Ok(json!({ "graceful": false }));
        };

        let grace = self.lifecycle.settings().graceful_shutdown;
        self.lifecycle
            .send_command(
                ctx,
                "shutdown_instance",
                host_id,
                instance_id,
                AgentCommand::ShutdownInstance {
                    grace_seconds: grace.as_secs(),
                },
            )
            .await?;

        let completed = ctx.wait_signal_for(SHUTDOWN_COMPLETE_SIGNAL, grace).await?.is_some();
        if !completed {
            warn!(%instance_id, grace_secs = grace.as_secs(), "Graceful shutdown timed out, destroying");
        }
        Ok(json!({ "graceful": completed }))
    }

    async fn destroy(
        &self,
        ctx: &mut StepContext,
        instance_id: InstanceId,
        record: &InstanceRecord,
    ) -> Result<Value, WorkflowError> {
        if let Some(host_id) = record.host_id.clone() {
            self.lifecycle
                .send_command(ctx, "destroy_instance", host_id, instance_id, AgentCommand::DestroyInstance)
                .await?;
        }
        self.lifecycle.release_network(ctx, instance_id).await?;
        let released = self.lifecycle.release_host(ctx, instance_id).await?;
        Ok(json!({ "released": released.is_some() }))
    }
}

#[async_trait]
impl Workflow for TerminateWorkflow {
    fn workflow_type(&self) -> &'static str {
        TERMINATE
    }

    fn steps(&self) -> &'static [&'static str] {
        STEPS
    }

    async fn run_step(&self, step: &str, ctx: &mut StepContext) -> Result<Value, WorkflowError> {
        let input: OperationInput = ctx.input()?;
        let instance_id = input.instance_id;

        if step == "terminating" {
            let message = if input.force { "Force terminating" } else { "Terminating" };
            let record = self
                .lifecycle
                .transition(ctx, instance_id, Transition::to(InstanceState::Terminating, message))
                .await?;
            return step_value(&record);
        }

        let record: InstanceRecord = ctx
            .step_result("terminating")?
            .ok_or_else(|| missing_result("terminating"))?;
        match step {
            "shutdown" => self.shutdown(ctx, &input, &record).await,
            "destroy" => self.destroy(ctx, instance_id, &record).await,
            "terminated" => {
                let record = self
                    .lifecycle
                    .transition(ctx, instance_id, Transition::to(InstanceState::Terminated, "Instance terminated"))
                    .await?;
                self.lifecycle
                    .notify(ctx, instance_id, format!("Instance {} terminated", record.spec.name))
                    .await;
                Ok(json!({ "state": record.state }))
            }
            other => Err(WorkflowError::Internal(format!("unknown terminate step {other}"))),
        }
    }

    async fn compensate(&self, ctx: &mut StepContext, failure: &WorkflowError) -> Result<(), WorkflowError> {
        self.lifecycle
            .roll_back_operation(ctx, InstanceState::Terminated, failure)
            .await
    }
}
