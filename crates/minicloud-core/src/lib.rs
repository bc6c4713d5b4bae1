//! Core types and utilities for minicloud.
//!
//! This crate provides the foundational types used throughout the orchestrator:
//!
//! - **Identifiers**: Strongly-typed IDs for instances, hosts and workflow executions
//! - **Idempotency keys**: The `executionId:stepName` keys carried by every activity call
//!
//! # Example
//!
//! ```
//! use minicloud_core::{ExecutionId, HostId, IdempotencyKey, InstanceId};
//!
//! let instance_id = InstanceId::generate();
//! let execution_id = ExecutionId::for_provision(&instance_id);
//! let host_id: HostId = "host-001".parse().unwrap();
//!
//! let key = IdempotencyKey::new(&execution_id, "provision", 0);
//! assert_eq!(key.as_str(), format!("{execution_id}:provision"));
//! assert_eq!(host_id.as_str(), "host-001");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod ids;

pub use ids::{ExecutionId, HostId, IdError, IdempotencyKey, InstanceId};
