//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.

use std::path::Path;
use std::sync::Arc;

use minicloud_core::{ExecutionId, HostId, InstanceId};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::types::{
    Host, InstanceEvent, InstanceRecord, QuarantineEntry, Reservation, WorkflowExecution,
};
use crate::Store;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Read and decode a single value.
    fn get_value<T: serde::de::DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    /// Decode every value of a column family in key order.
    fn scan_values<T: serde::de::DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>> {
        let cf = self.cf(cf_name)?;

        let mut values = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            values.push(Self::deserialize(&value)?);
        }

        Ok(values)
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

impl Store for RocksStore {
    // =========================================================================
    // Instance Operations
    // =========================================================================

    fn put_instance(&self, record: &InstanceRecord) -> Result<()> {
        let cf_instances = self.cf(cf::INSTANCES)?;
        let cf_by_project = self.cf(cf::INSTANCES_BY_PROJECT)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf_instances,
            keys::instance_key(&record.id),
            Self::serialize(record)?,
        );
        // Index entry is idempotent; the project never changes.
        batch.put_cf(
            &cf_by_project,
            keys::project_instance_key(&record.spec.project_id, &record.id),
            [],
        );

        self.write(batch)
    }

    fn get_instance(&self, instance_id: &InstanceId) -> Result<Option<InstanceRecord>> {
        self.get_value(cf::INSTANCES, &keys::instance_key(instance_id))
    }

    fn list_instances(&self) -> Result<Vec<InstanceRecord>> {
        self.scan_values(cf::INSTANCES)
    }

    fn list_instances_by_project(&self, project_id: &str) -> Result<Vec<InstanceRecord>> {
        let cf_by_project = self.cf(cf::INSTANCES_BY_PROJECT)?;
        let prefix = keys::project_prefix(project_id);

        let mut records = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf_by_project, IteratorMode::From(&prefix, Direction::Forward));

        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;

            // Stop if we're past the prefix
            if !key.starts_with(&prefix) {
                break;
            }

            let Some(instance_id) = keys::extract_instance_id_from_project_key(&key) else {
                continue;
            };
            if let Some(record) = self.get_instance(&instance_id)? {
                records.push(record);
            }
        }

        Ok(records)
    }

    fn count_active_instances_by_project(
        &self,
        project_id: &str,
        exclude: Option<&InstanceId>,
    ) -> Result<u32> {
        let count = self
            .list_instances_by_project(project_id)?
            .iter()
            .filter(|r| Some(&r.id) != exclude && r.state.counts_against_quota())
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    fn record_transition(&self, record: &InstanceRecord, event: &InstanceEvent) -> Result<()> {
        if event.instance_id != record.id || event.seq != record.event_seq {
            return Err(StoreError::Conflict(format!(
                "event {}#{} does not match record {}#{}",
                event.instance_id, event.seq, record.id, record.event_seq
            )));
        }

        let cf_instances = self.cf(cf::INSTANCES)?;
        let cf_by_project = self.cf(cf::INSTANCES_BY_PROJECT)?;
        let cf_events = self.cf(cf::INSTANCE_EVENTS)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf_instances,
            keys::instance_key(&record.id),
            Self::serialize(record)?,
        );
        batch.put_cf(
            &cf_by_project,
            keys::project_instance_key(&record.spec.project_id, &record.id),
            [],
        );
        batch.put_cf(
            &cf_events,
            keys::event_key(&event.instance_id, event.seq),
            Self::serialize(event)?,
        );

        self.write(batch)
    }

    fn list_events(&self, instance_id: &InstanceId, limit: usize) -> Result<Vec<InstanceEvent>> {
        let cf_events = self.cf(cf::INSTANCE_EVENTS)?;
        let prefix = keys::event_prefix(instance_id);
        let upper = keys::event_key(instance_id, u64::MAX);

        // Walk backwards from the newest event, then restore chronological order.
        let mut events = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf_events, IteratorMode::From(&upper, Direction::Reverse));

        for item in iter {
            if events.len() >= limit {
                break;
            }
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            events.push(Self::deserialize::<InstanceEvent>(&value)?);
        }

        events.reverse();
        Ok(events)
    }

    // =========================================================================
    // Host Operations
    // =========================================================================

    fn put_host(&self, host: &Host) -> Result<()> {
        let cf = self.cf(cf::HOSTS)?;
        self.db
            .put_cf(&cf, keys::host_key(&host.id), Self::serialize(host)?)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn get_host(&self, host_id: &HostId) -> Result<Option<Host>> {
        self.get_value(cf::HOSTS, &keys::host_key(host_id))
    }

    fn list_hosts(&self) -> Result<Vec<Host>> {
        self.scan_values(cf::HOSTS)
    }

    fn commit_reservation(&self, host: &Host, reservation: &Reservation) -> Result<()> {
        if !host.is_consistent() || reservation.host_id != host.id {
            return Err(StoreError::Conflict(format!(
                "reservation for {} would overcommit host {}",
                reservation.instance_id, host.id
            )));
        }

        let cf_hosts = self.cf(cf::HOSTS)?;
        let cf_reservations = self.cf(cf::RESERVATIONS)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_hosts, keys::host_key(&host.id), Self::serialize(host)?);
        batch.put_cf(
            &cf_reservations,
            keys::reservation_key(&reservation.instance_id),
            Self::serialize(reservation)?,
        );

        self.write(batch)
    }

    fn release_reservation(&self, host: &Host, instance_id: &InstanceId) -> Result<()> {
        let cf_hosts = self.cf(cf::HOSTS)?;
        let cf_reservations = self.cf(cf::RESERVATIONS)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_hosts, keys::host_key(&host.id), Self::serialize(host)?);
        batch.delete_cf(&cf_reservations, keys::reservation_key(instance_id));

        self.write(batch)
    }

    fn get_reservation(&self, instance_id: &InstanceId) -> Result<Option<Reservation>> {
        self.get_value(cf::RESERVATIONS, &keys::reservation_key(instance_id))
    }

    fn list_reservations(&self) -> Result<Vec<Reservation>> {
        self.scan_values(cf::RESERVATIONS)
    }

    // =========================================================================
    // Execution Operations
    // =========================================================================

    fn put_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        let cf = self.cf(cf::EXECUTIONS)?;
        self.db
            .put_cf(
                &cf,
                keys::execution_key(&execution.execution_id),
                Self::serialize(execution)?,
            )
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn get_execution(&self, execution_id: &ExecutionId) -> Result<Option<WorkflowExecution>> {
        self.get_value(cf::EXECUTIONS, &keys::execution_key(execution_id))
    }

    fn list_execution_ids(&self) -> Result<Vec<ExecutionId>> {
        let cf = self.cf(cf::EXECUTIONS)?;

        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            match std::str::from_utf8(&key).map(str::parse::<ExecutionId>) {
                Ok(Ok(id)) => ids.push(id),
                _ => tracing::warn!(key = %hex::encode(&key), "Skipping undecodable execution key"),
            }
        }

        Ok(ids)
    }

    fn quarantine_execution(&self, execution_id: &ExecutionId, reason: &str) -> Result<()> {
        let cf = self.cf(cf::QUARANTINE)?;
        let entry = QuarantineEntry {
            execution_id: execution_id.clone(),
            reason: reason.to_string(),
            quarantined_at: chrono::Utc::now(),
        };
        self.db
            .put_cf(&cf, keys::execution_key(execution_id), Self::serialize(&entry)?)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn get_quarantine(&self, execution_id: &ExecutionId) -> Result<Option<QuarantineEntry>> {
        self.get_value(cf::QUARANTINE, &keys::execution_key(execution_id))
    }

    fn list_quarantined(&self) -> Result<Vec<QuarantineEntry>> {
        self.scan_values(cf::QUARANTINE)
    }
}
