//! Durable workflow execution engine for minicloud.
//!
//! A workflow is a fixed sequence of named steps plus a compensation path.
//! The engine checkpoints every completed step and every completed activity
//! to the [`Store`](minicloud_store::Store), so a process restart resumes each
//! unfinished execution from its last checkpoint without invoking a completed
//! activity twice.
//!
//! # Primitives
//!
//! Step logic talks to the outside world only through [`StepContext`]:
//!
//! - `activity`: side-effecting call with retries and a recorded result
//! - `wait_signal` / `wait_signal_for`: consume a buffered external signal
//! - `sleep`: durable timer
//! - `expose`: publish state to queries
//!
//! Each of these is a suspension point where cancellation and the SLA
//! deadline are observed. Any step error moves the execution into
//! compensation, which runs to the end and leaves it `failed`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use async_trait::async_trait;
//! use minicloud_store::{RocksStore, Store};
//! use minicloud_workflow::{Engine, StepContext, Workflow, WorkflowError};
//! use serde_json::{json, Value};
//!
//! struct Hello;
//!
//! #[async_trait]
//! impl Workflow for Hello {
//!     fn workflow_type(&self) -> &'static str { "hello" }
//!     fn steps(&self) -> &'static [&'static str] { &["greet"] }
//!
//!     async fn run_step(&self, _step: &str, ctx: &mut StepContext) -> Result<Value, WorkflowError> {
//!         ctx.activity("greet", |_| async { Ok(json!("hi")) }).await
//!     }
//!
//!     async fn compensate(&self, _ctx: &mut StepContext, _e: &WorkflowError) -> Result<(), WorkflowError> {
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store: Arc<dyn Store> = Arc::new(RocksStore::open("/tmp/minicloud-db")?);
//! let engine = Engine::builder(store).register(Arc::new(Hello)).build();
//! engine.recover()?;
//!
//! let id = engine.start("hello", "greeting-1".parse()?, json!({}), Duration::from_secs(60))?;
//! let done = engine.wait(&id).await?;
//! println!("{:?}", done.phase);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod context;
pub mod engine;
pub mod error;
pub mod retry;

pub use context::{ActivityContext, StepContext, SLA_EXCEEDED};
pub use engine::{
    Engine, EngineBuilder, EngineConfig, ExecutionSnapshot, RecoveryReport, Workflow,
    COMPENSATE_STEP,
};
pub use error::{ActivityError, EngineError, Result, WorkflowError};
pub use retry::RetryPolicy;
