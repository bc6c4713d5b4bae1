//! `RocksDB` storage layer for minicloud.
//!
//! This crate provides persistent storage for instances, their audit log,
//! hosts, capacity reservations and workflow checkpoints using `RocksDB`
//! with column families for efficient indexing.
//!
//! # Architecture
//!
//! The storage uses the following column families:
//!
//! - `instances`: Primary instance records, keyed by `instance_id`
//! - `instances_by_project`: Index for quota counting by project
//! - `instance_events`: Append-only audit log, keyed by `instance_id || seq`
//! - `hosts`: Host inventory with capacity counters
//! - `reservations`: Capacity held by each instance
//! - `executions`: Workflow checkpoints, keyed by `execution_id`
//! - `quarantine`: Executions flagged for manual intervention
//!
//! # Example
//!
//! ```no_run
//! use minicloud_store::{RocksStore, Store};
//! use minicloud_core::InstanceId;
//!
//! let store = RocksStore::open("/tmp/minicloud-db").unwrap();
//!
//! // Read the last ten audit events of an instance
//! let instance_id = InstanceId::generate();
//! let events = store.list_events(&instance_id, 10).unwrap();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod rocks;
pub mod schema;
pub mod types;

pub use error::{Result, StoreError};
pub use rocks::RocksStore;
pub use types::{
    ExecutionPhase, Host, InstanceEvent, InstanceRecord, InstanceSpec, InstanceState,
    PendingSignal, QuarantineEntry, Reservation, WorkflowExecution,
};

use minicloud_core::{ExecutionId, HostId, InstanceId};

/// The storage trait defining all database operations.
///
/// This trait abstracts the storage layer so the engine, scheduler and
/// workflows receive an explicit handle instead of a process-wide client.
pub trait Store: Send + Sync {
    // =========================================================================
    // Instance Operations
    // =========================================================================

    /// Insert or update an instance record.
    ///
    /// This also maintains the project index.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_instance(&self, record: &InstanceRecord) -> Result<()>;

    /// Get an instance by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_instance(&self, instance_id: &InstanceId) -> Result<Option<InstanceRecord>>;

    /// List every instance record, in any state.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_instances(&self) -> Result<Vec<InstanceRecord>>;

    /// List all instances belonging to a project.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_instances_by_project(&self, project_id: &str) -> Result<Vec<InstanceRecord>>;

    /// Count a project's instances that still count against its quota,
    /// ignoring `exclude`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn count_active_instances_by_project(
        &self,
        project_id: &str,
        exclude: Option<&InstanceId>,
    ) -> Result<u32>;

    /// Write an updated record and its audit event in one atomic batch.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if the event does not belong to the
    /// record or does not carry the record's current sequence number.
    fn record_transition(&self, record: &InstanceRecord, event: &InstanceEvent) -> Result<()>;

    /// Return the most recent `limit` events of an instance, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_events(&self, instance_id: &InstanceId, limit: usize) -> Result<Vec<InstanceEvent>>;

    // =========================================================================
    // Host Operations
    // =========================================================================

    /// Insert or update a host.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_host(&self, host: &Host) -> Result<()>;

    /// Get a host by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_host(&self, host_id: &HostId) -> Result<Option<Host>>;

    /// List all hosts, ordered by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_hosts(&self) -> Result<Vec<Host>>;

    /// Write the updated host and a new reservation in one atomic batch.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if the host's counters exceed its totals.
    fn commit_reservation(&self, host: &Host, reservation: &Reservation) -> Result<()>;

    /// Write the updated host and delete the instance's reservation in one
    /// atomic batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn release_reservation(&self, host: &Host, instance_id: &InstanceId) -> Result<()>;

    /// Get the reservation held by an instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_reservation(&self, instance_id: &InstanceId) -> Result<Option<Reservation>>;

    /// List every reservation.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_reservations(&self) -> Result<Vec<Reservation>>;

    // =========================================================================
    // Execution Operations
    // =========================================================================

    /// Insert or update a workflow checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_execution(&self, execution: &WorkflowExecution) -> Result<()>;

    /// Get a workflow checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Serialization` if the stored bytes cannot be
    /// decoded.
    fn get_execution(&self, execution_id: &ExecutionId) -> Result<Option<WorkflowExecution>>;

    /// List the IDs of every stored execution.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_execution_ids(&self) -> Result<Vec<ExecutionId>>;

    /// Flag an execution for manual intervention. The checkpoint is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn quarantine_execution(&self, execution_id: &ExecutionId, reason: &str) -> Result<()>;

    /// Get the quarantine entry of an execution, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_quarantine(&self, execution_id: &ExecutionId) -> Result<Option<QuarantineEntry>>;

    /// List every quarantined execution.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_quarantined(&self) -> Result<Vec<QuarantineEntry>>;
}
