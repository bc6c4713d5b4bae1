//! IP and DNS assignment.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use minicloud_core::InstanceId;
use minicloud_store::InstanceRecord;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::CollaboratorError;

/// Addresses assigned to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkLease {
    /// Private IPv4 address.
    pub ip_address: String,
    /// Fully qualified DNS name.
    pub dns_name: String,
}

/// Assigns and reclaims network addresses.
///
/// Both operations must be idempotent: allocating twice for the same
/// instance returns the same lease, releasing an unknown instance succeeds.
#[async_trait]
pub trait NetworkAllocator: Send + Sync {
    /// Assign an address on `segment` to the instance.
    ///
    /// # Errors
    ///
    /// Returns `CollaboratorError::Permanent` if the segment has no free
    /// address.
    async fn allocate(&self, instance_id: &InstanceId, segment: &str) -> Result<NetworkLease, CollaboratorError>;

    /// Give the instance's address back to the pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the network controller cannot be reached.
    async fn release(&self, instance_id: &InstanceId) -> Result<(), CollaboratorError>;
}

/// Number of usable host addresses per `/16`: `a` and `b` in `0..=253`
/// shifted into `1..=254`.
const POOL_SIZE: usize = 254 * 254;

/// In-memory allocator over a `/16` pool, e.g. `10.0.x.y`.
///
/// Each instance starts probing at an offset derived from its ID, so the
/// same instance tends to receive the same address across runs.
pub struct PoolNetworkAllocator {
    cidr_prefix: String,
    dns_suffix: String,
    inner: Mutex<Leases>,
}

#[derive(Default)]
struct Leases {
    by_instance: HashMap<InstanceId, (usize, NetworkLease)>,
    in_use: HashSet<usize>,
}

impl PoolNetworkAllocator {
    /// Create an allocator handing out `{cidr_prefix}.x.y` addresses and
    /// `{instance_id}.{dns_suffix}` names.
    #[must_use]
    pub fn new(cidr_prefix: impl Into<String>, dns_suffix: impl Into<String>) -> Self {
        Self {
            cidr_prefix: cidr_prefix.into(),
            dns_suffix: dns_suffix.into(),
            inner: Mutex::new(Leases::default()),
        }
    }

    /// Number of leases currently held.
    #[must_use]
    pub fn active_leases(&self) -> usize {
        self.inner.lock().by_instance.len()
    }

    /// Mark the addresses held by live instances as taken.
    ///
    /// Records in a terminal state, or whose address lies outside this pool,
    /// are skipped. Returns the number of leases restored.
    pub fn restore<'a>(&self, records: impl IntoIterator<Item = &'a InstanceRecord>) -> usize {
        let mut leases = self.inner.lock();
        let mut restored = 0;
        for record in records {
            if record.state.is_terminal() {
                continue;
            }
            let (Some(ip_address), Some(dns_name)) = (&record.ip_address, &record.dns_name) else {
                continue;
            };
            let Some(slot) = self.slot(ip_address) else {
                warn!(instance_id = %record.id, ip = %ip_address, "Address outside the pool, not restored");
                continue;
            };
            if !leases.in_use.insert(slot) {
                warn!(instance_id = %record.id, ip = %ip_address, "Address held by more than one instance");
            }
            let lease = NetworkLease {
                ip_address: ip_address.clone(),
                dns_name: dns_name.clone(),
            };
            leases.by_instance.insert(record.id, (slot, lease));
            restored += 1;
        }
        info!(restored, "Network leases restored");
        restored
    }

    fn address(&self, slot: usize) -> String {
        format!("{}.{}.{}", self.cidr_prefix, slot / 254, slot % 254 + 1)
    }

    fn slot(&self, ip_address: &str) -> Option<usize> {
        let rest = ip_address.strip_prefix(self.cidr_prefix.as_str())?.strip_prefix('.')?;
        let (a, b) = rest.split_once('.')?;
        let (a, b) = (a.parse::<usize>().ok()?, b.parse::<usize>().ok()?);
        (a < 254 && (1..=254).contains(&b)).then(|| a * 254 + b - 1)
    }

    fn start_slot(instance_id: &InstanceId) -> usize {
        let bytes = instance_id.as_uuid().as_bytes();
        usize::from(u16::from_be_bytes([bytes[0], bytes[1]])) % POOL_SIZE
    }
}

#[async_trait]
impl NetworkAllocator for PoolNetworkAllocator {
    async fn allocate(&self, instance_id: &InstanceId, segment: &str) -> Result<NetworkLease, CollaboratorError> {
        let mut leases = self.inner.lock();
        if let Some((_, existing)) = leases.by_instance.get(instance_id) {
            debug!(%instance_id, ip = %existing.ip_address, "Lease already held");
            return Ok(existing.clone());
        }

        let start = Self::start_slot(instance_id);
        let slot = (0..POOL_SIZE)
            .map(|offset| (start + offset) % POOL_SIZE)
            .find(|slot| !leases.in_use.contains(slot))
            .ok_or_else(|| CollaboratorError::Permanent(format!("address pool exhausted on segment {segment}")))?;

        let lease = NetworkLease {
            ip_address: self.address(slot),
            dns_name: format!("{instance_id}.{}", self.dns_suffix),
        };
        leases.in_use.insert(slot);
        leases.by_instance.insert(*instance_id, (slot, lease.clone()));

        info!(%instance_id, segment, ip = %lease.ip_address, dns = %lease.dns_name, "Network lease assigned");
        Ok(lease)
    }

    async fn release(&self, instance_id: &InstanceId) -> Result<(), CollaboratorError> {
        let mut leases = self.inner.lock();
        if let Some((slot, lease)) = leases.by_instance.remove(instance_id) {
            leases.in_use.remove(&slot);
            info!(%instance_id, ip = %lease.ip_address, "Network lease released");
        }
        Ok(())
    }
}
