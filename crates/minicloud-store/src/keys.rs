//! Key encoding utilities for `RocksDB`.
//!
//! This module provides functions to encode and decode keys for various indexes.
//! All keys are designed to support efficient prefix scans.

use minicloud_core::{ExecutionId, HostId, InstanceId};

/// Encode an instance key (just the instance ID bytes).
#[must_use]
pub fn instance_key(instance_id: &InstanceId) -> Vec<u8> {
    instance_id.as_bytes().to_vec()
}

/// Encode a project prefix: `len(project) || project`.
///
/// The length byte keeps `p1` from prefixing `p10`.
#[must_use]
pub fn project_prefix(project_id: &str) -> Vec<u8> {
    let bytes = project_id.as_bytes();
    let len = u16::try_from(bytes.len()).unwrap_or(u16::MAX);
    let mut key = Vec::with_capacity(2 + bytes.len() + 16);
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(&bytes[..usize::from(len)]);
    key
}

/// Encode a project-instance index key: `project_prefix || instance_id`.
#[must_use]
pub fn project_instance_key(project_id: &str, instance_id: &InstanceId) -> Vec<u8> {
    let mut key = project_prefix(project_id);
    key.extend_from_slice(instance_id.as_bytes());
    key
}

/// Extract the instance ID from a project-instance key.
///
/// Returns `None` if the key is shorter than an instance ID.
#[must_use]
pub fn extract_instance_id_from_project_key(key: &[u8]) -> Option<InstanceId> {
    let start = key.len().checked_sub(16)?;
    let bytes: [u8; 16] = key[start..].try_into().ok()?;
    Some(InstanceId::from_uuid(uuid::Uuid::from_bytes(bytes)))
}

/// Encode an event key: `instance_id || seq_be`.
///
/// Big-endian sequence numbers make a prefix scan return events in order.
#[must_use]
pub fn event_key(instance_id: &InstanceId, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(instance_id.as_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Encode an instance prefix for scanning all events of an instance.
#[must_use]
pub fn event_prefix(instance_id: &InstanceId) -> Vec<u8> {
    instance_id.as_bytes().to_vec()
}

/// Encode a host key.
#[must_use]
pub fn host_key(host_id: &HostId) -> Vec<u8> {
    host_id.as_str().as_bytes().to_vec()
}

/// Encode a reservation key (the holding instance's ID).
#[must_use]
pub fn reservation_key(instance_id: &InstanceId) -> Vec<u8> {
    instance_id.as_bytes().to_vec()
}

/// Encode an execution key.
#[must_use]
pub fn execution_key(execution_id: &ExecutionId) -> Vec<u8> {
    execution_id.as_str().as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_instance_key_roundtrip() {
        let instance_id = InstanceId::generate();
        let key = project_instance_key("proj-1", &instance_id);
        assert_eq!(key.len(), 2 + 6 + 16);

        let extracted = extract_instance_id_from_project_key(&key).unwrap();
        assert_eq!(extracted, instance_id);
    }

    #[test]
    fn project_prefix_is_not_ambiguous() {
        let instance_id = InstanceId::generate();
        let key = project_instance_key("p10", &instance_id);
        assert!(key.starts_with(&project_prefix("p10")));
        assert!(!key.starts_with(&project_prefix("p1")));
    }

    #[test]
    fn event_keys_sort_by_sequence() {
        let instance_id = InstanceId::generate();
        let k1 = event_key(&instance_id, 2);
        let k2 = event_key(&instance_id, 256);
        assert!(k1 < k2);
        assert!(k1.starts_with(&event_prefix(&instance_id)));
    }
}
