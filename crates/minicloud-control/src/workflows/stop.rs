//! Stop workflow: `RUNNING` to `STOPPED`.
//!
//! The host reservation and network lease are kept, so a later start lands
//! on the same host with the same address.

use std::sync::Arc;

use async_trait::async_trait;
use minicloud_store::{InstanceRecord, InstanceState};
use minicloud_workflow::{StepContext, Workflow, WorkflowError};
use serde_json::{json, Value};

use super::{missing_result, step_value, Lifecycle, OperationInput, Transition, STOP};
use crate::collaborators::AgentCommand;

const STEPS: &[&str] = &["stop", "stopped"];

/// Stops a running instance.
pub struct StopWorkflow {
    lifecycle: Arc<Lifecycle>,
}

impl StopWorkflow {
    /// Create the workflow.
    #[must_use]
    pub const fn new(lifecycle: Arc<Lifecycle>) -> Self {
        Self { lifecycle }
    }
}

#[async_trait]
impl Workflow for StopWorkflow {
    fn workflow_type(&self) -> &'static str {
        STOP
    }

    fn steps(&self) -> &'static [&'static str] {
        STEPS
    }

    async fn run_step(&self, step: &str, ctx: &mut StepContext) -> Result<Value, WorkflowError> {
        let input: OperationInput = ctx.input()?;
        let instance_id = input.instance_id;

        match step {
            "stop" => {
                let record = self
                    .lifecycle
                    .transition(ctx, instance_id, Transition::to(InstanceState::Stopping, "Stopping instance"))
                    .await?;
                let host_id = record
                    .host_id
                    .clone()
                    .ok_or_else(|| WorkflowError::Internal(format!("instance {instance_id} has no host")))?;
                self.lifecycle
                    .send_command(ctx, "stop_instance", host_id, instance_id, AgentCommand::StopInstance)
                    .await?;
                step_value(&record)
            }
            "stopped" => {
                let _: InstanceRecord = ctx.step_result("stop")?.ok_or_else(|| missing_result("stop"))?;
                let record = self
                    .lifecycle
                    .transition(ctx, instance_id, Transition::to(InstanceState::Stopped, "Instance stopped"))
                    .await?;
                Ok(json!({ "state": record.state }))
            }
            other => Err(WorkflowError::Internal(format!("unknown stop step {other}"))),
        }
    }

    async fn compensate(&self, ctx: &mut StepContext, failure: &WorkflowError) -> Result<(), WorkflowError> {
        self.lifecycle
            .roll_back_operation(ctx, InstanceState::Failed, failure)
            .await
    }
}
