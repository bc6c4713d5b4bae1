//! Instance lifecycle orchestrator for minicloud.
//!
//! This crate turns instance commands (provision, stop, start, terminate)
//! into durable workflow executions and drives them against the host agent,
//! the network allocator and the health probe.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        HTTP (axum)                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   OrchestratorService                       │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────────┐    │
//! │  │  Admission  │ │  Workflows  │ │    Lifecycle        │    │
//! │  │  Control    │ │  (4 types)  │ │    State Machine    │    │
//! │  └─────────────┘ └─────────────┘ └─────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!               ┌──────────────┼──────────────┐
//!               ▼              ▼              ▼
//!        ┌──────────┐   ┌──────────┐   ┌──────────────┐
//!        │  Engine  │   │  Hosts   │   │ Collaborators│
//!        │(RocksDB) │   │(Registry)│   │ (agent, net) │
//!        └──────────┘   └──────────┘   └──────────────┘
//! ```
//!
//! # State Machine
//!
//! Every state change goes through the table in [`lifecycle`]:
//!
//! - `REQUESTED` → `VALIDATING` → `SCHEDULING` → `PROVISIONING` →
//!   `BOOTSTRAPPING` → `CONFIGURING_NETWORK` → `HEALTHCHECKING` → `RUNNING`
//! - `RUNNING` → `STOPPING` → `STOPPED` → `BOOTSTRAPPING` (start)
//! - `RUNNING` or `STOPPED` → `TERMINATING` → `TERMINATED`
//! - any in-flight state → `ROLLING_BACK` → `FAILED` (or `TERMINATED`)

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod collaborators;
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod service;
pub mod validation;
pub mod workflows;

pub use config::OrchestratorConfig;
pub use error::{CollaboratorError, ControlError, Result};
pub use http::{create_router, ApiError};
pub use service::{InstanceView, OrchestratorService};
pub use workflows::{Lifecycle, LifecycleSettings};

// Re-export commonly used types from dependencies for convenience
pub use minicloud_core::{ExecutionId, HostId, InstanceId};
pub use minicloud_store::{Host, InstanceEvent, InstanceRecord, InstanceSpec, InstanceState};
