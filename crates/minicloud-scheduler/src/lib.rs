//! Host placement and capacity reservation for minicloud.
//!
//! This crate provides the [`HostRegistry`], the inventory of compute hosts
//! the orchestrator places instances on. It handles:
//!
//! - Filtering hosts with enough free CPU and memory
//! - Scoring viable hosts and picking a deterministic winner
//! - Reserving capacity atomically with respect to the viability check
//! - Releasing capacity when an instance is rolled back or terminated
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Instance Workflows                            │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │ schedule / release
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       HostRegistry                               │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────────────┐   │
//! │  │  Snapshot   │ │  Score &    │ │  Lock winner, compare   │   │
//! │  │  hosts      │→│  select     │→│  generation, commit     │   │
//! │  └─────────────┘ └─────────────┘ └─────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │ host + reservation in one batch
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Store                                    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use minicloud_core::InstanceId;
//! use minicloud_scheduler::{HostRegistry, ResourceRequest};
//! use minicloud_store::{Host, RocksStore, Store};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store: Arc<dyn Store> = Arc::new(RocksStore::open("/tmp/minicloud-db")?);
//! let registry = HostRegistry::load(store)?;
//!
//! registry.register_host(Host::new("host-001".parse()?, "rack-1", "a", 8, 16384))?;
//!
//! let instance_id = InstanceId::generate();
//! let reservation = registry.schedule(instance_id, &ResourceRequest::new(2, 4096))?;
//! println!("placed on {}", reservation.host_id);
//!
//! registry.release(&instance_id)?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod registry;
pub mod scoring;
pub mod types;

pub use error::{Result, SchedulerError};
pub use registry::HostRegistry;
pub use types::{Candidate, ResourceRequest};
