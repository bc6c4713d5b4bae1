//! The primitives a workflow step is written against.
//!
//! Every primitive that waits is a suspension point: cancellation and the SLA
//! deadline are observed there, and its outcome is memoised in the
//! checkpoint under an idempotency key so that replay after a crash returns
//! the recorded outcome instead of running it again.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use minicloud_core::{ExecutionId, IdempotencyKey};
use minicloud_store::PendingSignal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::{LiveExecution, Shared};
use crate::error::{ActivityError, WorkflowError};
use crate::retry::RetryPolicy;

/// Message carried by the error raised when the SLA deadline passes.
pub const SLA_EXCEEDED: &str = "SLA deadline exceeded";

/// Handed to an activity on every attempt.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    /// Activity name, for logging.
    pub activity: String,
    /// Stable key of this call; identical across retries and replays.
    pub idempotency_key: IdempotencyKey,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Execution context of one workflow step (or of the compensation path).
pub struct StepContext {
    shared: Arc<Shared>,
    live: Arc<LiveExecution>,
    execution_id: ExecutionId,
    step: String,
    seq: u32,
    deadline: Option<Instant>,
}

impl StepContext {
    pub(crate) fn new(
        shared: Arc<Shared>,
        live: Arc<LiveExecution>,
        step: &str,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            shared,
            execution_id: live.execution_id.clone(),
            live,
            step: step.to_string(),
            seq: 0,
            deadline,
        }
    }

    /// ID of the running execution.
    #[must_use]
    pub const fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    /// Name of the running step.
    #[must_use]
    pub fn step(&self) -> &str {
        &self.step
    }

    /// Whether this context runs the compensation path.
    #[must_use]
    pub const fn is_compensating(&self) -> bool {
        self.deadline.is_none()
    }

    /// Decode the execution input.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowError::CheckpointCorruption` if the input does not
    /// match `T`.
    pub fn input<T: DeserializeOwned>(&self) -> Result<T, WorkflowError> {
        let input = self.live.state.lock().input.clone();
        serde_json::from_value(input)
            .map_err(|e| WorkflowError::CheckpointCorruption(format!("input: {e}")))
    }

    /// Decode the result of a completed step, if it ran.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowError::CheckpointCorruption` if the stored result
    /// does not match `T`.
    pub fn step_result<T: DeserializeOwned>(&self, step: &str) -> Result<Option<T>, WorkflowError> {
        let value = self.live.state.lock().context.get(step).cloned();
        value
            .map(|v| {
                serde_json::from_value(v).map_err(|e| {
                    WorkflowError::CheckpointCorruption(format!("result of {step}: {e}"))
                })
            })
            .transpose()
    }

    /// The failure that sent the execution into compensation, if any.
    #[must_use]
    pub fn failure(&self) -> Option<WorkflowError> {
        let failure = self.live.state.lock().failure.clone();
        failure.and_then(|v| serde_json::from_value(v).ok())
    }

    /// Publish a value to queries. Persisted with the next checkpoint.
    pub fn expose<T: Serialize>(&self, value: &T) {
        match serde_json::to_value(value) {
            Ok(value) => {
                let mut state = self.live.state.lock();
                state.exposed = value;
                self.live.publish(&state);
            }
            Err(e) => warn!(execution_id = %self.execution_id, error = %e, "Cannot expose value"),
        }
    }

    /// Run an activity under the engine's default retry policy.
    ///
    /// # Errors
    ///
    /// Returns the activity's fatal error, `ActivityFailed` once retries are
    /// exhausted, or `Cancelled` / `AgentTimeout` if observed before the
    /// activity starts or while backing off.
    pub async fn activity<T, F, Fut>(&mut self, name: &str, f: F) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(ActivityContext) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, ActivityError>> + Send + 'static,
    {
        let policy = self.shared.config.retry.clone();
        self.activity_with_policy(name, &policy, f).await
    }

    /// Run an activity under an explicit retry policy.
    ///
    /// The activity runs on the worker pool. Once it succeeds its result is
    /// checkpointed; a replay returns the recorded result without invoking
    /// `f`. An in-flight activity is never preempted.
    ///
    /// # Errors
    ///
    /// See [`StepContext::activity`].
    pub async fn activity_with_policy<T, F, Fut>(
        &mut self,
        name: &str,
        policy: &RetryPolicy,
        f: F,
    ) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(ActivityContext) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, ActivityError>> + Send + 'static,
    {
        let key = self.next_key();
        if let Some(value) = self.memoized(&key) {
            debug!(execution_id = %self.execution_id, key = %key, "Replaying recorded activity");
            return decode_memo(name, value);
        }
        self.suspension_point()?;

        let mut attempt = 1;
        loop {
            let ctx = ActivityContext {
                activity: name.to_string(),
                idempotency_key: key.clone(),
                attempt,
            };
            let outcome = match AbortOnDrop(tokio::spawn(f(ctx))).join().await {
                Ok(outcome) => outcome,
                Err(e) => Err(ActivityError::Fatal(WorkflowError::activity_failed(
                    name,
                    format!("activity task failed: {e}"),
                ))),
            };

            match outcome {
                Ok(value) => {
                    let encoded = serde_json::to_value(&value)
                        .map_err(|e| WorkflowError::Internal(format!("encode {name}: {e}")))?;
                    self.record(&key, encoded)?;
                    return Ok(value);
                }
                Err(ActivityError::Fatal(e)) => {
                    warn!(
                        execution_id = %self.execution_id,
                        activity = name,
                        attempt,
                        error = %e,
                        "Activity failed"
                    );
                    return Err(e);
                }
                Err(ActivityError::Retryable(message)) => {
                    let Some(delay) = policy.delay_after(attempt) else {
                        warn!(
                            execution_id = %self.execution_id,
                            activity = name,
                            attempt,
                            error = %message,
                            "Activity retries exhausted"
                        );
                        return Err(WorkflowError::activity_failed(name, message));
                    };
                    warn!(
                        execution_id = %self.execution_id,
                        activity = name,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %message,
                        "Activity failed, retrying"
                    );
                    self.pause(delay).await?;
                    attempt += 1;
                }
            }
        }
    }

    /// Suspend until the named signal arrives.
    ///
    /// A signal delivered before this call is taken from the buffer.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` or `AgentTimeout` if observed while waiting.
    pub async fn wait_signal(&mut self, name: &str) -> Result<Value, WorkflowError> {
        self.receive(name, None)
            .await?
            .ok_or_else(|| WorkflowError::Internal(format!("wait for {name} ended without payload")))
    }

    /// Suspend until the named signal arrives or `timeout` elapses.
    ///
    /// Returns `None` on timeout. The timeout is recorded like any other
    /// outcome, so replay does not wait again.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` or `AgentTimeout` if observed while waiting.
    pub async fn wait_signal_for(
        &mut self,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<Value>, WorkflowError> {
        self.receive(name, Some(timeout)).await
    }

    /// Durable timer.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` or `AgentTimeout` if observed while sleeping.
    pub async fn sleep(&mut self, duration: Duration) -> Result<(), WorkflowError> {
        let key = self.next_key();
        if self.memoized(&key).is_some() {
            return Ok(());
        }
        self.suspension_point()?;
        self.pause(duration).await?;
        self.record(&key, json!({ "fired": true }))
    }

    /// Check for a pending cancellation or an expired deadline.
    ///
    /// Only the forward path observes either; compensation always runs to
    /// the end.
    pub(crate) fn suspension_point(&self) -> Result<(), WorkflowError> {
        let Some(deadline) = self.deadline else {
            return Ok(());
        };
        if self.live.state.lock().cancel_requested {
            info!(execution_id = %self.execution_id, step = %self.step, "Cancellation observed");
            return Err(WorkflowError::Cancelled);
        }
        if Instant::now() >= deadline {
            warn!(execution_id = %self.execution_id, step = %self.step, "SLA deadline exceeded");
            return Err(WorkflowError::AgentTimeout(SLA_EXCEEDED.to_string()));
        }
        Ok(())
    }

    async fn receive(
        &mut self,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Value>, WorkflowError> {
        let key = self.next_key();
        if let Some(value) = self.memoized(&key) {
            return Ok(value.get("signal").cloned());
        }
        self.suspension_point()?;

        let limit = timeout.map(|t| Instant::now() + t);
        debug!(execution_id = %self.execution_id, signal = name, "Waiting for signal");

        loop {
            if let Some(payload) = self.take_signal(&key, name)? {
                info!(execution_id = %self.execution_id, signal = name, "Signal consumed");
                return Ok(Some(payload));
            }
            self.suspension_point()?;

            let wake = self.live.wake.notified();
            let stop_at = match (self.deadline, limit) {
                (Some(d), Some(l)) => Some(d.min(l)),
                (d, l) => d.or(l),
            };
            let Some(stop_at) = stop_at else {
                wake.await;
                continue;
            };
            if tokio::time::timeout_at(stop_at, wake).await.is_ok() {
                continue;
            }

            let deadline_passed = self.deadline.is_some_and(|d| Instant::now() >= d);
            if let Some(limit) = limit {
                if !deadline_passed && Instant::now() >= limit {
                    debug!(execution_id = %self.execution_id, signal = name, "Signal wait timed out");
                    self.record(&key, json!({ "timeout": true }))?;
                    return Ok(None);
                }
            }
        }
    }

    /// Take the first buffered signal named `name`, recording it under `key`.
    fn take_signal(&self, key: &IdempotencyKey, name: &str) -> Result<Option<Value>, WorkflowError> {
        let mut state = self.live.state.lock();
        let Some(pos) = state.pending_signals.iter().position(|s| s.name == name) else {
            return Ok(None);
        };
        let PendingSignal { payload, .. } = state.pending_signals.remove(pos);
        state
            .memo
            .insert(key.as_str().to_string(), json!({ "signal": payload.clone() }));
        self.live
            .checkpoint(self.shared.store.as_ref(), &mut state)
            .map_err(WorkflowError::from)?;
        Ok(Some(payload))
    }

    /// Sleep that gives up when the deadline passes or cancellation arrives.
    async fn pause(&self, duration: Duration) -> Result<(), WorkflowError> {
        match self.deadline {
            Some(deadline) => {
                let wake_at = (Instant::now() + duration).min(deadline);
                tokio::time::sleep_until(wake_at).await;
                self.suspension_point()
            }
            None => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
        }
    }

    fn next_key(&mut self) -> IdempotencyKey {
        let key = IdempotencyKey::new(&self.execution_id, &self.step, self.seq);
        self.seq += 1;
        key
    }

    fn memoized(&self, key: &IdempotencyKey) -> Option<Value> {
        self.live.state.lock().memo.get(key.as_str()).cloned()
    }

    fn record(&self, key: &IdempotencyKey, value: Value) -> Result<(), WorkflowError> {
        let mut state = self.live.state.lock();
        state.memo.insert(key.as_str().to_string(), value);
        self.live
            .checkpoint(self.shared.store.as_ref(), &mut state)
            .map_err(WorkflowError::from)
    }
}

fn decode_memo<T: DeserializeOwned>(name: &str, value: Value) -> Result<T, WorkflowError> {
    serde_json::from_value(value)
        .map_err(|e| WorkflowError::CheckpointCorruption(format!("recorded result of {name}: {e}")))
}

/// Aborts the spawned activity if the awaiting driver goes away.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> AbortOnDrop<T> {
    async fn join(mut self) -> Result<T, tokio::task::JoinError> {
        (&mut self.0).await
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
