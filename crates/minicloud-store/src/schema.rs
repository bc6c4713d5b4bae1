//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Primary instance records, keyed by `instance_id`.
    pub const INSTANCES: &str = "instances";

    /// Index: instances by project, keyed by `len(project) || project || instance_id`.
    pub const INSTANCES_BY_PROJECT: &str = "instances_by_project";

    /// Append-only instance audit log, keyed by `instance_id || seq_be`.
    pub const INSTANCE_EVENTS: &str = "instance_events";

    /// Host inventory, keyed by `host_id`.
    pub const HOSTS: &str = "hosts";

    /// Capacity reservations, keyed by the holding `instance_id`.
    pub const RESERVATIONS: &str = "reservations";

    /// Workflow checkpoints, keyed by `execution_id`.
    pub const EXECUTIONS: &str = "executions";

    /// Executions that cannot be resumed safely, keyed by `execution_id`.
    pub const QUARANTINE: &str = "quarantine";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::INSTANCES,
        cf::INSTANCES_BY_PROJECT,
        cf::INSTANCE_EVENTS,
        cf::HOSTS,
        cf::RESERVATIONS,
        cf::EXECUTIONS,
        cf::QUARANTINE,
    ]
}
