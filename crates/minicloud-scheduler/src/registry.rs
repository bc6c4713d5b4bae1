//! Host inventory and atomic capacity reservation.
//!
//! Each host lives in its own mutex-guarded slot. Scheduling snapshots every
//! host, picks a winner with [`scoring::select`], then locks only the winner
//! and commits the reservation if the host's generation is unchanged since
//! the snapshot. A changed generation means another reservation landed in
//! between; the selection is simply redone against fresh counters.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use minicloud_core::{HostId, InstanceId};
use minicloud_store::{Host, Reservation, Store};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Result, SchedulerError};
use crate::scoring;
use crate::types::ResourceRequest;

/// In-memory host inventory backed by the store.
pub struct HostRegistry {
    store: Arc<dyn Store>,
    hosts: RwLock<BTreeMap<HostId, Arc<Mutex<Host>>>>,
    reservations: Mutex<HashMap<InstanceId, Reservation>>,
}

impl HostRegistry {
    /// Load hosts and reservations from the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn load(store: Arc<dyn Store>) -> Result<Self> {
        let hosts = store
            .list_hosts()?
            .into_iter()
            .map(|h| (h.id.clone(), Arc::new(Mutex::new(h))))
            .collect::<BTreeMap<_, _>>();
        let reservations = store
            .list_reservations()?
            .into_iter()
            .map(|r| (r.instance_id, r))
            .collect::<HashMap<_, _>>();

        info!(
            hosts = hosts.len(),
            reservations = reservations.len(),
            "Host registry loaded"
        );

        Ok(Self {
            store,
            hosts: RwLock::new(hosts),
            reservations: Mutex::new(reservations),
        })
    }

    /// Add a host, or update the name, zone and totals of a known one.
    ///
    /// Allocations of a known host are preserved.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidHost` if the new totals are below the
    /// host's current allocations.
    pub fn register_host(&self, host: Host) -> Result<Host> {
        if host.cpu_total == 0 || host.memory_total_mb == 0 {
            return Err(SchedulerError::InvalidHost(format!(
                "{} must have non-zero capacity",
                host.id
            )));
        }

        // A new host is persisted and inserted under the same write lock, so
        // a racing registration of the ID can only take the update path.
        let slot = {
            let mut hosts = self.hosts.write();
            match hosts.entry(host.id.clone()) {
                Entry::Occupied(entry) => entry.get().clone(),
                Entry::Vacant(entry) => {
                    let mut fresh = host;
                    fresh.cpu_allocated = 0;
                    fresh.memory_allocated_mb = 0;
                    fresh.generation = 0;
                    self.store.put_host(&fresh)?;
                    entry.insert(Arc::new(Mutex::new(fresh.clone())));
                    info!(host_id = %fresh.id, zone = %fresh.zone, "Host registered");
                    return Ok(fresh);
                }
            }
        };

        let mut current = slot.lock();
        let mut updated = current.clone();
        updated.name = host.name;
        updated.zone = host.zone;
        updated.cpu_total = host.cpu_total;
        updated.memory_total_mb = host.memory_total_mb;
        updated.generation += 1;
        if !updated.is_consistent() {
            return Err(SchedulerError::InvalidHost(format!(
                "{} totals below current allocations",
                updated.id
            )));
        }
        self.store.put_host(&updated)?;
        *current = updated.clone();
        info!(host_id = %updated.id, "Host updated");
        Ok(updated)
    }

    /// Snapshot of every host, ordered by ID.
    #[must_use]
    pub fn list_hosts(&self) -> Vec<Host> {
        self.hosts.read().values().map(|h| h.lock().clone()).collect()
    }

    /// Snapshot of one host.
    #[must_use]
    pub fn get_host(&self, host_id: &HostId) -> Option<Host> {
        self.hosts.read().get(host_id).map(|h| h.lock().clone())
    }

    /// The reservation currently held by an instance.
    #[must_use]
    pub fn reservation(&self, instance_id: &InstanceId) -> Option<Reservation> {
        self.reservations.lock().get(instance_id).cloned()
    }

    /// Choose a host for `request` and reserve the capacity for `instance_id`.
    ///
    /// If the instance already holds a reservation it is returned unchanged,
    /// so a replayed scheduling step never reserves twice. Calls for one
    /// instance are expected to come from its single workflow execution.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::NoCapacity` if no host is viable, or a store
    /// error if the reservation cannot be persisted.
    pub fn schedule(&self, instance_id: InstanceId, request: &ResourceRequest) -> Result<Reservation> {
        if let Some(existing) = self.reservation(&instance_id) {
            debug!(%instance_id, host_id = %existing.host_id, "Reservation already held");
            return Ok(existing);
        }

        loop {
            let snapshot = self.list_hosts();
            let Some(candidate) = scoring::select(&snapshot, request) else {
                warn!(
                    %instance_id,
                    cpu = request.cpu,
                    memory_mb = request.memory_mb,
                    "No viable host"
                );
                return Err(SchedulerError::NoCapacity {
                    cpu: request.cpu,
                    memory_mb: request.memory_mb,
                });
            };

            let Some(slot) = self.hosts.read().get(&candidate.host_id).cloned() else {
                continue;
            };
            let mut host = slot.lock();
            if host.generation != candidate.generation {
                debug!(host_id = %host.id, "Host changed during selection, retrying");
                continue;
            }

            let mut updated = host.clone();
            updated.cpu_allocated += request.cpu;
            updated.memory_allocated_mb += request.memory_mb;
            updated.generation += 1;

            let reservation = Reservation {
                instance_id,
                host_id: updated.id.clone(),
                cpu: request.cpu,
                memory_mb: request.memory_mb,
                reserved_at: chrono::Utc::now(),
            };
            self.store.commit_reservation(&updated, &reservation)?;
            *host = updated;
            drop(host);

            self.reservations
                .lock()
                .insert(instance_id, reservation.clone());
            info!(
                %instance_id,
                host_id = %reservation.host_id,
                score = candidate.score,
                "Capacity reserved"
            );
            return Ok(reservation);
        }
    }

    /// Return an instance's reserved capacity to its host.
    ///
    /// Releasing an instance without a reservation is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a store error if the release cannot be persisted; the
    /// reservation is then kept.
    pub fn release(&self, instance_id: &InstanceId) -> Result<Option<Reservation>> {
        let Some(reservation) = self.reservations.lock().remove(instance_id) else {
            return Ok(None);
        };

        let slot = self.hosts.read().get(&reservation.host_id).cloned();
        if let Some(slot) = slot {
            let mut host = slot.lock();
            let mut updated = host.clone();
            updated.cpu_allocated = updated.cpu_allocated.saturating_sub(reservation.cpu);
            updated.memory_allocated_mb = updated
                .memory_allocated_mb
                .saturating_sub(reservation.memory_mb);
            updated.generation += 1;

            if let Err(e) = self.store.release_reservation(&updated, instance_id) {
                drop(host);
                self.reservations
                    .lock()
                    .insert(*instance_id, reservation.clone());
                return Err(e.into());
            }
            *host = updated;
        } else {
            warn!(%instance_id, host_id = %reservation.host_id, "Reservation on unknown host");
        }

        info!(%instance_id, host_id = %reservation.host_id, "Capacity released");
        Ok(Some(reservation))
    }
}
