//! The workflow execution engine.
//!
//! One driver task per live execution runs the workflow's steps in order,
//! checkpointing after each one. Activities run as separate tasks on the
//! runtime's worker pool; the driver awaits them, so an execution never has
//! two activities in flight. Everything an execution owns (its checkpoint,
//! signal buffer and exposed state) sits behind its own mutex, so there is no
//! lock shared across executions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use minicloud_core::ExecutionId;
use minicloud_store::{ExecutionPhase, PendingSignal, Store, StoreError, WorkflowExecution};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::context::StepContext;
use crate::error::{EngineError, Result, WorkflowError};
use crate::retry::RetryPolicy;

/// Step name under which compensation activities are keyed.
pub const COMPENSATE_STEP: &str = "compensate";

/// A workflow definition: a fixed sequence of named steps plus a
/// compensation path.
///
/// Step logic must be deterministic. Anything that touches the outside world
/// or reads the clock goes through a [`StepContext`] primitive, so replay
/// after a crash makes the same decisions.
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    /// Registered type name, e.g. `provision`.
    fn workflow_type(&self) -> &'static str;

    /// Forward steps, in order.
    fn steps(&self) -> &'static [&'static str];

    /// Run one forward step. The returned value is stored in the checkpoint
    /// under the step name.
    async fn run_step(&self, step: &str, ctx: &mut StepContext) -> std::result::Result<Value, WorkflowError>;

    /// Undo whatever the forward steps managed to do.
    ///
    /// Must be idempotent: it may run again from the start after a crash,
    /// with completed activities replayed from the checkpoint.
    async fn compensate(
        &self,
        ctx: &mut StepContext,
        failure: &WorkflowError,
    ) -> std::result::Result<(), WorkflowError>;
}

/// Engine tuning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Policy used by [`StepContext::activity`].
    pub retry: RetryPolicy,
}

/// Point-in-time view of an execution, as returned by queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    /// Execution ID.
    pub execution_id: ExecutionId,
    /// Workflow type.
    pub workflow_type: String,
    /// Current phase.
    pub phase: ExecutionPhase,
    /// Step currently running, if any.
    pub step: Option<String>,
    /// Whatever the workflow last exposed.
    pub exposed: Value,
    /// Why the execution is compensating or failed.
    pub failure: Option<WorkflowError>,
    /// Whether cancellation has been requested.
    pub cancel_requested: bool,
    /// Start timestamp.
    pub started_at: DateTime<Utc>,
    /// SLA deadline.
    pub deadline_at: DateTime<Utc>,
    /// Last checkpoint timestamp.
    pub updated_at: DateTime<Utc>,
}

impl ExecutionSnapshot {
    fn from_execution(execution: &WorkflowExecution, steps: &[&str]) -> Self {
        let step = match execution.phase {
            ExecutionPhase::Forward => steps.get(execution.current_step).map(ToString::to_string),
            ExecutionPhase::Compensating => Some(COMPENSATE_STEP.to_string()),
            ExecutionPhase::Completed | ExecutionPhase::Failed => None,
        };
        Self {
            execution_id: execution.execution_id.clone(),
            workflow_type: execution.workflow_type.clone(),
            phase: execution.phase,
            step,
            exposed: execution.exposed.clone(),
            failure: execution
                .failure
                .clone()
                .and_then(|v| serde_json::from_value(v).ok()),
            cancel_requested: execution.cancel_requested,
            started_at: execution.started_at,
            deadline_at: execution.deadline_at,
            updated_at: execution.updated_at,
        }
    }

    /// Whether the execution has finished.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

/// Result of [`Engine::recover`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Executions whose drivers were restarted.
    pub resumed: Vec<ExecutionId>,
    /// Executions flagged for manual intervention during this pass.
    pub quarantined: Vec<ExecutionId>,
}

pub(crate) struct Shared {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) config: EngineConfig,
    workflows: HashMap<&'static str, Arc<dyn Workflow>>,
    live: Mutex<HashMap<ExecutionId, Arc<LiveExecution>>>,
    drivers: Mutex<HashMap<ExecutionId, JoinHandle<()>>>,
}

/// In-memory state of an execution with a running driver.
pub(crate) struct LiveExecution {
    pub(crate) execution_id: ExecutionId,
    pub(crate) state: Mutex<WorkflowExecution>,
    pub(crate) wake: Notify,
    steps: &'static [&'static str],
    snapshot: watch::Sender<ExecutionSnapshot>,
}

impl LiveExecution {
    fn new(execution: WorkflowExecution, steps: &'static [&'static str]) -> Self {
        let (snapshot, _) = watch::channel(ExecutionSnapshot::from_execution(&execution, steps));
        Self {
            execution_id: execution.execution_id.clone(),
            state: Mutex::new(execution),
            wake: Notify::new(),
            steps,
            snapshot,
        }
    }

    /// Persist the checkpoint and publish it to queries.
    pub(crate) fn checkpoint(&self, store: &dyn Store, state: &mut WorkflowExecution) -> Result<()> {
        state.updated_at = Utc::now();
        store.put_execution(state)?;
        self.publish(state);
        Ok(())
    }

    pub(crate) fn publish(&self, state: &WorkflowExecution) {
        self.snapshot
            .send_replace(ExecutionSnapshot::from_execution(state, self.steps));
    }
}

/// Builder for an [`Engine`].
pub struct EngineBuilder {
    store: Arc<dyn Store>,
    config: EngineConfig,
    workflows: HashMap<&'static str, Arc<dyn Workflow>>,
}

impl EngineBuilder {
    /// Override the engine configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a workflow definition under its type name.
    #[must_use]
    pub fn register(mut self, workflow: Arc<dyn Workflow>) -> Self {
        self.workflows.insert(workflow.workflow_type(), workflow);
        self
    }

    /// Build the engine. No execution runs until `start` or `recover`.
    #[must_use]
    pub fn build(self) -> Engine {
        Engine {
            shared: Arc::new(Shared {
                store: self.store,
                config: self.config,
                workflows: self.workflows,
                live: Mutex::new(HashMap::new()),
                drivers: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// Durable, crash-recoverable workflow execution engine.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    /// Start building an engine over `store`.
    #[must_use]
    pub fn builder(store: Arc<dyn Store>) -> EngineBuilder {
        EngineBuilder {
            store,
            config: EngineConfig::default(),
            workflows: HashMap::new(),
        }
    }

    /// Create and persist an execution, then run it in the background.
    ///
    /// Starting an ID that already exists is a no-op returning the ID.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::UnknownWorkflow` for an unregistered type, or a
    /// store error if the execution cannot be persisted.
    pub fn start(
        &self,
        workflow_type: &str,
        execution_id: ExecutionId,
        input: Value,
        sla: Duration,
    ) -> Result<ExecutionId> {
        let workflow = self.workflow(workflow_type)?;

        let mut live = self.shared.live.lock();
        if live.contains_key(&execution_id) || self.shared.store.get_execution(&execution_id)?.is_some() {
            debug!(%execution_id, "Execution already exists");
            return Ok(execution_id);
        }

        let execution =
            WorkflowExecution::new(execution_id.clone(), workflow.workflow_type(), input, sla);
        self.shared.store.put_execution(&execution)?;

        let entry = Arc::new(LiveExecution::new(execution, workflow.steps()));
        live.insert(execution_id.clone(), entry.clone());
        drop(live);

        info!(%execution_id, workflow_type, sla_secs = sla.as_secs(), "Execution started");
        self.spawn_driver(entry, workflow);
        Ok(execution_id)
    }

    /// Deliver a signal. It is buffered until the execution waits for it and
    /// consumed exactly once.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionNotFound`, `ExecutionCompleted` for a finished
    /// execution, or a store error if the signal cannot be persisted.
    pub fn signal(&self, execution_id: &ExecutionId, name: &str, payload: Value) -> Result<()> {
        let signal = PendingSignal {
            name: name.to_string(),
            payload,
        };

        let live_map = self.shared.live.lock();
        if let Some(live) = live_map.get(execution_id).cloned() {
            drop(live_map);
            let mut state = live.state.lock();
            if state.is_terminal() {
                return Err(EngineError::ExecutionCompleted(execution_id.to_string()));
            }
            state.pending_signals.push(signal);
            if let Err(e) = live.checkpoint(self.shared.store.as_ref(), &mut state) {
                state.pending_signals.pop();
                return Err(e);
            }
            drop(state);
            live.wake.notify_one();
        } else {
            let mut execution = self.load(execution_id)?;
            if execution.is_terminal() {
                return Err(EngineError::ExecutionCompleted(execution_id.to_string()));
            }
            // Not running here yet; the buffer is picked up on recovery. The
            // live map stays locked until the write lands so `recover` cannot
            // resume from the older checkpoint in between.
            execution.pending_signals.push(signal);
            execution.updated_at = Utc::now();
            self.shared.store.put_execution(&execution)?;
            drop(live_map);
        }

        info!(%execution_id, signal = name, "Signal delivered");
        Ok(())
    }

    /// Non-blocking snapshot of an execution.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionNotFound` if the execution does not exist.
    pub fn query(&self, execution_id: &ExecutionId) -> Result<ExecutionSnapshot> {
        if let Some(live) = self.live(execution_id) {
            let snapshot = live.snapshot.borrow().clone();
            return Ok(snapshot);
        }
        let execution = self.load(execution_id)?;
        let steps = self
            .shared
            .workflows
            .get(execution.workflow_type.as_str())
            .map_or(&[][..], |w| w.steps());
        Ok(ExecutionSnapshot::from_execution(&execution, steps))
    }

    /// Request cooperative cancellation.
    ///
    /// The next suspension point on the forward path observes the request
    /// and routes the execution into compensation.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionNotFound`, `ExecutionCompleted`, or a store error.
    pub fn cancel(&self, execution_id: &ExecutionId) -> Result<()> {
        let live_map = self.shared.live.lock();
        if let Some(live) = live_map.get(execution_id).cloned() {
            drop(live_map);
            let mut state = live.state.lock();
            if state.is_terminal() {
                return Err(EngineError::ExecutionCompleted(execution_id.to_string()));
            }
            state.cancel_requested = true;
            live.checkpoint(self.shared.store.as_ref(), &mut state)?;
            drop(state);
            live.wake.notify_one();
        } else {
            let mut execution = self.load(execution_id)?;
            if execution.is_terminal() {
                return Err(EngineError::ExecutionCompleted(execution_id.to_string()));
            }
            execution.cancel_requested = true;
            execution.updated_at = Utc::now();
            self.shared.store.put_execution(&execution)?;
            drop(live_map);
        }

        info!(%execution_id, "Cancellation requested");
        Ok(())
    }

    /// Wait until the execution finishes.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionNotFound`, `NotRunning` for an unfinished execution
    /// without a driver, or `Shutdown` if the driver stops before finishing.
    pub async fn wait(&self, execution_id: &ExecutionId) -> Result<ExecutionSnapshot> {
        if let Some(live) = self.live(execution_id) {
            let mut rx = live.snapshot.subscribe();
            drop(live);
            let snapshot = rx
                .wait_for(ExecutionSnapshot::is_terminal)
                .await
                .map_err(|_| EngineError::Shutdown)?
                .clone();
            return Ok(snapshot);
        }

        let snapshot = self.query(execution_id)?;
        if snapshot.is_terminal() {
            Ok(snapshot)
        } else {
            Err(EngineError::NotRunning(execution_id.to_string()))
        }
    }

    /// Resume every unfinished execution from its last checkpoint.
    ///
    /// Checkpoints that cannot be resumed safely are quarantined, never
    /// deleted.
    ///
    /// # Errors
    ///
    /// Returns a store error if the checkpoints cannot be listed.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for execution_id in self.shared.store.list_execution_ids()? {
            // Held until the entry is inserted, so a concurrent signal or cancel
            // on a parked execution either lands before the load or sees it live.
            let mut live_map = self.shared.live.lock();
            if live_map.contains_key(&execution_id)
                || self.shared.store.get_quarantine(&execution_id)?.is_some()
            {
                continue;
            }

            let execution = match self.shared.store.get_execution(&execution_id) {
                Ok(Some(execution)) => execution,
                Ok(None) => continue,
                Err(StoreError::Serialization(reason)) => {
                    self.quarantine(&execution_id, &format!("undecodable checkpoint: {reason}"))?;
                    report.quarantined.push(execution_id);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if execution.is_terminal() {
                continue;
            }

            let workflow = match self.validate_checkpoint(&execution) {
                Ok(workflow) => workflow,
                Err(reason) => {
                    self.quarantine(&execution_id, &reason)?;
                    report.quarantined.push(execution_id);
                    continue;
                }
            };

            let entry = Arc::new(LiveExecution::new(execution, workflow.steps()));
            live_map.insert(execution_id.clone(), entry.clone());
            drop(live_map);
            info!(%execution_id, "Resuming execution");
            self.spawn_driver(entry, workflow);
            report.resumed.push(execution_id);
        }

        info!(
            resumed = report.resumed.len(),
            quarantined = report.quarantined.len(),
            "Recovery finished"
        );
        Ok(report)
    }

    /// Abort every driver and its in-flight activity.
    ///
    /// Checkpoints are left as they are; a later `recover` resumes them.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self
            .shared
            .drivers
            .lock()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            // Cancelled tasks resolve to a JoinError; nothing to report.
            let _ = handle.await;
        }
        self.shared.live.lock().clear();
        info!("Engine shut down");
    }

    /// Registered workflow type names.
    #[must_use]
    pub fn workflow_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.shared.workflows.keys().copied().collect();
        types.sort_unstable();
        types
    }

    fn workflow(&self, workflow_type: &str) -> Result<Arc<dyn Workflow>> {
        self.shared
            .workflows
            .get(workflow_type)
            .cloned()
            .ok_or_else(|| EngineError::UnknownWorkflow(workflow_type.to_string()))
    }

    fn live(&self, execution_id: &ExecutionId) -> Option<Arc<LiveExecution>> {
        self.shared.live.lock().get(execution_id).cloned()
    }

    fn load(&self, execution_id: &ExecutionId) -> Result<WorkflowExecution> {
        self.shared
            .store
            .get_execution(execution_id)?
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))
    }

    fn validate_checkpoint(&self, execution: &WorkflowExecution) -> std::result::Result<Arc<dyn Workflow>, String> {
        let workflow = self
            .workflow(&execution.workflow_type)
            .map_err(|e| e.to_string())?;
        let steps = workflow.steps().len();

        match execution.phase {
            ExecutionPhase::Forward if execution.current_step > steps => Err(format!(
                "step index {} out of range for {} ({steps} steps)",
                execution.current_step, execution.workflow_type
            )),
            ExecutionPhase::Compensating => execution
                .failure
                .clone()
                .ok_or_else(|| "compensating without a recorded failure".to_string())
                .and_then(|v| {
                    serde_json::from_value::<WorkflowError>(v)
                        .map_err(|e| format!("undecodable failure: {e}"))
                })
                .map(|_| workflow),
            _ => Ok(workflow),
        }
    }

    fn quarantine(&self, execution_id: &ExecutionId, reason: &str) -> Result<()> {
        error!(
            %execution_id,
            error = %WorkflowError::CheckpointCorruption(reason.to_string()),
            "Execution quarantined; manual intervention required"
        );
        self.shared.store.quarantine_execution(execution_id, reason)?;
        Ok(())
    }

    fn spawn_driver(&self, live: Arc<LiveExecution>, workflow: Arc<dyn Workflow>) {
        let execution_id = live.execution_id.clone();
        let shared = self.shared.clone();
        let handle = tokio::spawn(drive(shared, live, workflow));
        self.shared.drivers.lock().insert(execution_id, handle);
    }
}

fn deadline_instant(deadline_at: DateTime<Utc>) -> Instant {
    let remaining = (deadline_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    Instant::now() + remaining
}

async fn drive(shared: Arc<Shared>, live: Arc<LiveExecution>, workflow: Arc<dyn Workflow>) {
    let execution_id = live.execution_id.clone();

    match run(&shared, &live, workflow.as_ref()).await {
        Ok(()) => {}
        Err(EngineError::CheckpointCorruption { reason, .. }) => {
            error!(%execution_id, reason = %reason, "Execution quarantined; manual intervention required");
            if let Err(e) = shared.store.quarantine_execution(&execution_id, &reason) {
                error!(%execution_id, error = %e, "Failed to quarantine execution");
            }
        }
        Err(e) => {
            error!(%execution_id, error = %e, "Execution driver stopped; recover to resume");
        }
    }

    shared.live.lock().remove(&execution_id);
    shared.drivers.lock().remove(&execution_id);
}

async fn run(shared: &Arc<Shared>, live: &Arc<LiveExecution>, workflow: &dyn Workflow) -> Result<()> {
    let execution_id = live.execution_id.clone();
    let steps = workflow.steps();
    let deadline = deadline_instant(live.state.lock().deadline_at);

    loop {
        let (phase, index, failure) = {
            let state = live.state.lock();
            (state.phase, state.current_step, state.failure.clone())
        };

        match phase {
            ExecutionPhase::Forward => {
                let Some(step) = steps.get(index).copied() else {
                    let mut state = live.state.lock();
                    state.phase = ExecutionPhase::Completed;
                    live.checkpoint(shared.store.as_ref(), &mut state)?;
                    info!(%execution_id, workflow_type = workflow.workflow_type(), "Execution completed");
                    return Ok(());
                };

                debug!(%execution_id, step, "Running step");
                let mut ctx = StepContext::new(shared.clone(), live.clone(), step, Some(deadline));
                let result = match ctx.suspension_point() {
                    Ok(()) => workflow.run_step(step, &mut ctx).await,
                    Err(e) => Err(e),
                };

                let mut state = live.state.lock();
                match result {
                    Ok(value) => {
                        state.context.insert(step.to_string(), value);
                        state.current_step = index + 1;
                    }
                    // Unreadable checkpoint data quarantines; it never compensates.
                    Err(WorkflowError::CheckpointCorruption(reason)) => {
                        return Err(EngineError::CheckpointCorruption {
                            execution_id: execution_id.to_string(),
                            reason: format!("step {step}: {reason}"),
                        });
                    }
                    Err(err) => {
                        warn!(%execution_id, step, error = %err, "Step failed, compensating");
                        state.phase = ExecutionPhase::Compensating;
                        state.failure = Some(
                            serde_json::to_value(&err)
                                .map_err(|e| EngineError::Serialization(e.to_string()))?,
                        );
                    }
                }
                live.checkpoint(shared.store.as_ref(), &mut state)?;
            }
            ExecutionPhase::Compensating => {
                let failure: WorkflowError = failure
                    .and_then(|v| serde_json::from_value(v).ok())
                    .ok_or_else(|| EngineError::CheckpointCorruption {
                        execution_id: execution_id.to_string(),
                        reason: "undecodable failure".to_string(),
                    })?;

                info!(%execution_id, error = %failure, "Compensating");
                let mut ctx = StepContext::new(shared.clone(), live.clone(), COMPENSATE_STEP, None);
                if let Err(e) = workflow.compensate(&mut ctx, &failure).await {
                    error!(
                        %execution_id,
                        error = %WorkflowError::Rollback(e.to_string()),
                        "Rollback incomplete; operator follow-up required"
                    );
                }

                let mut state = live.state.lock();
                state.phase = ExecutionPhase::Failed;
                live.checkpoint(shared.store.as_ref(), &mut state)?;
                info!(%execution_id, "Execution failed");
                return Ok(());
            }
            ExecutionPhase::Completed | ExecutionPhase::Failed => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ActivityError;
    use minicloud_store::RocksStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const STEPS: &[&str] = &["reserve", "wait", "finish"];

    /// Three steps. `reserve` makes two activity calls, `wait` blocks on
    /// the `go` signal, `finish` makes one activity call. Activity calls are
    /// counted per idempotency key.
    #[derive(Default)]
    struct Tally {
        calls: Mutex<HashMap<String, usize>>,
        compensations: AtomicUsize,
        /// Key of the activity that blocks forever.
        block_on: Option<String>,
        /// Key of the activity that fails permanently.
        fail_on: Option<String>,
        reached: Arc<Notify>,
        transient_failures: AtomicUsize,
    }

    impl Tally {
        fn calls(&self, key: &str) -> usize {
            self.calls.lock().get(key).copied().unwrap_or(0)
        }
    }

    struct TallyWorkflow(Arc<Tally>);

    #[derive(Deserialize)]
    struct Reserved {
        key: String,
    }

    impl TallyWorkflow {
        async fn call(&self, ctx: &mut StepContext, name: &str) -> std::result::Result<Value, WorkflowError> {
            let tally = self.0.clone();
            ctx.activity(name, move |actx| {
                let tally = tally.clone();
                async move {
                    let key = actx.idempotency_key.as_str().to_string();
                    if tally.block_on.as_deref() == Some(key.as_str()) {
                        tally.reached.notify_one();
                        std::future::pending::<()>().await;
                    }
                    *tally.calls.lock().entry(key.clone()).or_default() += 1;
                    if tally.fail_on.as_deref() == Some(key.as_str()) {
                        return Err(ActivityError::Fatal(WorkflowError::activity_failed(
                            "tally", "boom",
                        )));
                    }
                    if tally
                        .transient_failures
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok()
                    {
                        return Err(ActivityError::retryable("flaky"));
                    }
                    Ok(json!({ "key": key, "attempt": actx.attempt }))
                }
            })
            .await
        }
    }

    #[async_trait]
    impl Workflow for TallyWorkflow {
        fn workflow_type(&self) -> &'static str {
            "tally"
        }

        fn steps(&self) -> &'static [&'static str] {
            STEPS
        }

        async fn run_step(&self, step: &str, ctx: &mut StepContext) -> std::result::Result<Value, WorkflowError> {
            match step {
                "reserve" => {
                    self.call(ctx, "first").await?;
                    let second = self.call(ctx, "second").await?;
                    ctx.expose(&json!({ "stage": "reserved" }));
                    Ok(second)
                }
                "wait" => {
                    let payload = ctx.wait_signal("go").await?;
                    Ok(payload)
                }
                "finish" => {
                    let reserved: Option<Reserved> = ctx.step_result("reserve")?;
                    let go: Option<Value> = ctx.step_result("wait")?;
                    self.call(ctx, "finish").await?;
                    ctx.expose(&json!({ "stage": "done", "reserved": reserved.map(|r| r.key) }));
                    Ok(go.unwrap_or(Value::Null))
                }
                other => Err(WorkflowError::Internal(format!("unknown step {other}"))),
            }
        }

        async fn compensate(
            &self,
            ctx: &mut StepContext,
            failure: &WorkflowError,
        ) -> std::result::Result<(), WorkflowError> {
            self.0.compensations.fetch_add(1, Ordering::SeqCst);
            ctx.expose(&json!({ "stage": "rolled_back", "error": failure.user_message() }));
            Ok(())
        }
    }

    fn open_store(dir: &TempDir) -> Arc<dyn Store> {
        Arc::new(RocksStore::open(dir.path()).unwrap())
    }

    fn engine(store: Arc<dyn Store>, tally: Arc<Tally>) -> Engine {
        Engine::builder(store)
            .register(Arc::new(TallyWorkflow(tally)))
            .build()
    }

    fn exec_id(s: &str) -> ExecutionId {
        s.parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn runs_to_completion_with_buffered_signal() {
        let dir = TempDir::new().unwrap();
        let tally = Arc::new(Tally::default());
        let engine = engine(open_store(&dir), tally.clone());
        let id = exec_id("exec-1");

        engine
            .start("tally", id.clone(), json!({}), Duration::from_secs(60))
            .unwrap();
        // Delivered before the workflow waits for it.
        engine.signal(&id, "go", json!({ "ip": "10.0.0.7" })).unwrap();

        let done = engine.wait(&id).await.unwrap();
        assert_eq!(done.phase, ExecutionPhase::Completed);
        assert_eq!(done.exposed["stage"], "done");
        assert_eq!(done.exposed["reserved"], "exec-1:reserve#1");
        assert_eq!(tally.calls("exec-1:reserve"), 1);
        assert_eq!(tally.calls("exec-1:reserve#1"), 1);
        assert_eq!(tally.calls("exec-1:finish"), 1);

        let stored = open_store_result(&engine, &id);
        assert_eq!(stored.context["finish"]["ip"], "10.0.0.7");
        assert!(stored.pending_signals.is_empty());
    }

    fn open_store_result(engine: &Engine, id: &ExecutionId) -> WorkflowExecution {
        engine.shared.store.get_execution(id).unwrap().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let tally = Arc::new(Tally::default());
        let engine = engine(open_store(&dir), tally.clone());
        let id = exec_id("exec-1");

        engine.start("tally", id.clone(), json!({}), Duration::from_secs(60)).unwrap();
        engine.start("tally", id.clone(), json!({}), Duration::from_secs(60)).unwrap();
        engine.signal(&id, "go", json!(null)).unwrap();
        engine.wait(&id).await.unwrap();

        assert_eq!(tally.calls("exec-1:reserve"), 1);
        assert!(matches!(
            engine.start("nope", exec_id("exec-2"), json!({}), Duration::from_secs(1)),
            Err(EngineError::UnknownWorkflow(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn signal_to_finished_execution_is_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = engine(open_store(&dir), Arc::new(Tally::default()));
        let id = exec_id("exec-1");

        engine.start("tally", id.clone(), json!({}), Duration::from_secs(60)).unwrap();
        engine.signal(&id, "go", json!(null)).unwrap();
        engine.wait(&id).await.unwrap();

        assert!(matches!(
            engine.signal(&id, "go", json!(null)),
            Err(EngineError::ExecutionCompleted(_))
        ));
        assert!(matches!(
            engine.signal(&exec_id("missing"), "go", json!(null)),
            Err(EngineError::ExecutionNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_with_backoff() {
        let dir = TempDir::new().unwrap();
        let tally = Arc::new(Tally {
            transient_failures: AtomicUsize::new(2),
            ..Tally::default()
        });
        let engine = engine(open_store(&dir), tally.clone());
        let id = exec_id("exec-1");
        let started = Instant::now();

        engine.start("tally", id.clone(), json!({}), Duration::from_secs(600)).unwrap();
        engine.signal(&id, "go", json!(null)).unwrap();
        let done = engine.wait(&id).await.unwrap();

        assert_eq!(done.phase, ExecutionPhase::Completed);
        // Two failed attempts back off 1s then 2s.
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(tally.calls("exec-1:reserve"), 3);
        let stored = open_store_result(&engine, &id);
        assert_eq!(stored.memo["exec-1:reserve"]["attempt"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_route_to_compensation() {
        let dir = TempDir::new().unwrap();
        let tally = Arc::new(Tally {
            transient_failures: AtomicUsize::new(usize::MAX),
            ..Tally::default()
        });
        let engine = engine(open_store(&dir), tally.clone());
        let id = exec_id("exec-1");

        engine.start("tally", id.clone(), json!({}), Duration::from_secs(600)).unwrap();
        let done = engine.wait(&id).await.unwrap();

        assert_eq!(done.phase, ExecutionPhase::Failed);
        assert_eq!(tally.calls("exec-1:reserve"), 5);
        assert_eq!(tally.compensations.load(Ordering::SeqCst), 1);
        assert!(matches!(
            done.failure,
            Some(WorkflowError::ActivityFailed { ref activity, .. }) if activity == "first"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_activity_error_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let tally = Arc::new(Tally {
            fail_on: Some("exec-1:reserve#1".to_string()),
            ..Tally::default()
        });
        let engine = engine(open_store(&dir), tally.clone());
        let id = exec_id("exec-1");

        engine.start("tally", id.clone(), json!({}), Duration::from_secs(600)).unwrap();
        let done = engine.wait(&id).await.unwrap();

        assert_eq!(done.phase, ExecutionPhase::Failed);
        assert_eq!(tally.calls("exec-1:reserve#1"), 1);
        assert_eq!(done.exposed["stage"], "rolled_back");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_forces_compensation() {
        let dir = TempDir::new().unwrap();
        let tally = Arc::new(Tally::default());
        let engine = engine(open_store(&dir), tally.clone());
        let id = exec_id("exec-1");

        engine.start("tally", id.clone(), json!({}), Duration::from_secs(5)).unwrap();
        let done = engine.wait(&id).await.unwrap();

        assert_eq!(done.phase, ExecutionPhase::Failed);
        assert_eq!(
            done.failure,
            Some(WorkflowError::AgentTimeout(crate::context::SLA_EXCEEDED.to_string()))
        );
        assert_eq!(tally.calls("exec-1:finish"), 0);
        assert_eq!(tally.compensations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_observed_at_next_suspension_point() {
        let dir = TempDir::new().unwrap();
        let tally = Arc::new(Tally::default());
        let engine = engine(open_store(&dir), tally.clone());
        let id = exec_id("exec-1");

        engine.start("tally", id.clone(), json!({}), Duration::from_secs(600)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(engine.query(&id).unwrap().step.as_deref(), Some("wait"));

        engine.cancel(&id).unwrap();
        let done = engine.wait(&id).await.unwrap();

        assert_eq!(done.failure, Some(WorkflowError::Cancelled));
        assert_eq!(tally.compensations.load(Ordering::SeqCst), 1);
        assert!(matches!(engine.cancel(&id), Err(EngineError::ExecutionCompleted(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn query_does_not_block_on_inflight_activity() {
        let dir = TempDir::new().unwrap();
        let tally = Arc::new(Tally {
            block_on: Some("exec-1:reserve#1".to_string()),
            ..Tally::default()
        });
        let engine = engine(open_store(&dir), tally.clone());
        let id = exec_id("exec-1");

        engine.start("tally", id.clone(), json!({}), Duration::from_secs(600)).unwrap();
        tally.reached.notified().await;

        let snapshot = engine.query(&id).unwrap();
        assert_eq!(snapshot.phase, ExecutionPhase::Forward);
        assert_eq!(snapshot.step.as_deref(), Some("reserve"));
        engine.shutdown().await;
    }

    /// Crash at each activity in turn, recover in a fresh engine and check
    /// that the run ends like an uninterrupted one, with no completed
    /// activity invoked twice.
    #[tokio::test(start_paused = true)]
    async fn recovery_after_crash_at_every_checkpoint() {
        for crash_key in ["exec-1:reserve", "exec-1:reserve#1", "exec-1:finish"] {
            let dir = TempDir::new().unwrap();
            let store = open_store(&dir);
            let id = exec_id("exec-1");
            let tally = Arc::new(Tally {
                block_on: Some(crash_key.to_string()),
                ..Tally::default()
            });

            let first = engine(store.clone(), tally.clone());
            first.start("tally", id.clone(), json!({}), Duration::from_secs(600)).unwrap();
            first.signal(&id, "go", json!({ "n": 1 })).unwrap();
            tally.reached.notified().await;
            first.shutdown().await;

            let survivor = Arc::new(Tally::default());
            *survivor.calls.lock() = tally.calls.lock().clone();
            let second = engine(store.clone(), survivor.clone());
            let report = second.recover().unwrap();
            assert_eq!(report.resumed, vec![id.clone()]);

            let done = second.wait(&id).await.unwrap();
            assert_eq!(done.phase, ExecutionPhase::Completed, "crash at {crash_key}");
            for key in ["exec-1:reserve", "exec-1:reserve#1", "exec-1:finish"] {
                assert_eq!(survivor.calls(key), 1, "{key} after crash at {crash_key}");
            }
            let stored = store.get_execution(&id).unwrap().unwrap();
            assert_eq!(stored.context["finish"]["n"], 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn signal_before_recovery_is_buffered() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = exec_id("exec-1");
        let tally = Arc::new(Tally {
            block_on: Some("exec-1:reserve".to_string()),
            ..Tally::default()
        });
        let first = engine(store.clone(), tally.clone());
        first.start("tally", id.clone(), json!({}), Duration::from_secs(600)).unwrap();
        tally.reached.notified().await;
        first.shutdown().await;

        let second = engine(store, Arc::new(Tally::default()));
        second.signal(&id, "go", json!(null)).unwrap();
        assert!(matches!(second.wait(&id).await, Err(EngineError::NotRunning(_))));

        second.recover().unwrap();
        assert_eq!(second.wait(&id).await.unwrap().phase, ExecutionPhase::Completed);
    }

    #[tokio::test]
    async fn unrecoverable_checkpoints_are_quarantined() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let unknown = WorkflowExecution::new(exec_id("exec-unknown"), "retired", json!({}), Duration::from_secs(60));
        store.put_execution(&unknown).unwrap();

        let mut out_of_range =
            WorkflowExecution::new(exec_id("exec-range"), "tally", json!({}), Duration::from_secs(60));
        out_of_range.current_step = 9;
        store.put_execution(&out_of_range).unwrap();

        let mut finished =
            WorkflowExecution::new(exec_id("exec-done"), "tally", json!({}), Duration::from_secs(60));
        finished.phase = ExecutionPhase::Completed;
        store.put_execution(&finished).unwrap();

        let engine = engine(store.clone(), Arc::new(Tally::default()));
        let report = engine.recover().unwrap();

        assert!(report.resumed.is_empty());
        assert_eq!(report.quarantined.len(), 2);
        assert_eq!(store.list_quarantined().unwrap().len(), 2);
        // Never deleted.
        assert!(store.get_execution(&exec_id("exec-unknown")).unwrap().is_some());
        assert!(store.get_execution(&exec_id("exec-range")).unwrap().is_some());

        // A second pass leaves quarantined executions alone.
        let again = engine.recover().unwrap();
        assert!(again.quarantined.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_step_result_is_quarantined_not_compensated() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = exec_id("exec-1");

        let mut execution = WorkflowExecution::new(id.clone(), "tally", json!({}), Duration::from_secs(600));
        execution.current_step = 2;
        execution.context.insert("reserve".to_string(), json!("not a reservation"));
        execution.context.insert("wait".to_string(), Value::Null);
        store.put_execution(&execution).unwrap();

        let tally = Arc::new(Tally::default());
        let engine = engine(store.clone(), tally.clone());
        assert_eq!(engine.recover().unwrap().resumed, vec![id.clone()]);

        while engine.live(&id).is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let quarantined = store.list_quarantined().unwrap();
        assert_eq!(quarantined.len(), 1);
        assert!(store.get_quarantine(&id).unwrap().is_some());
        assert_eq!(tally.compensations.load(Ordering::SeqCst), 0);
        assert_eq!(tally.calls("exec-1:finish"), 0);
        let stored = store.get_execution(&id).unwrap().unwrap();
        assert_eq!(stored.phase, ExecutionPhase::Forward);
        assert!(stored.failure.is_none());

        // Left for an operator; recovery does not pick it up again.
        assert!(engine.recover().unwrap().resumed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_of_parked_execution_survives_recovery() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = exec_id("exec-1");
        let parked = WorkflowExecution::new(id.clone(), "tally", json!({}), Duration::from_secs(600));
        store.put_execution(&parked).unwrap();

        let tally = Arc::new(Tally::default());
        let engine = engine(store.clone(), tally.clone());
        engine.signal(&id, "go", json!({ "n": 2 })).unwrap();
        engine.cancel(&id).unwrap();

        let stored = store.get_execution(&id).unwrap().unwrap();
        assert!(stored.cancel_requested);
        assert_eq!(stored.pending_signals.len(), 1);

        // Recovery resumes from the checkpoint that carries both writes.
        assert_eq!(engine.recover().unwrap().resumed, vec![id.clone()]);
        assert!(matches!(engine.cancel(&id), Ok(())));
        let done = engine.wait(&id).await.unwrap();
        assert_eq!(done.failure, Some(WorkflowError::Cancelled));
        assert_eq!(tally.compensations.load(Ordering::SeqCst), 1);
        assert_eq!(tally.calls("exec-1:reserve"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn signals_racing_recovery_are_never_lost() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = exec_id("exec-1");
        let parked = WorkflowExecution::new(id.clone(), "tally", json!({}), Duration::from_secs(600));
        store.put_execution(&parked).unwrap();

        let engine = engine(store.clone(), Arc::new(Tally::default()));
        let signaller = {
            let engine = engine.clone();
            let id = id.clone();
            std::thread::spawn(move || engine.signal(&id, "go", json!({ "n": 3 })))
        };
        engine.recover().unwrap();
        signaller.join().unwrap().unwrap();

        // Whichever side won, the signal reached the running driver.
        let done = engine.wait(&id).await.unwrap();
        assert_eq!(done.phase, ExecutionPhase::Completed);
        assert_eq!(store.get_execution(&id).unwrap().unwrap().context["finish"]["n"], 3);
    }
}
