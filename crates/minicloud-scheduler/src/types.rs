//! Types for the scheduler crate.

use minicloud_core::HostId;
use minicloud_store::InstanceSpec;
use serde::{Deserialize, Serialize};

/// Resources an instance asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Virtual CPUs.
    pub cpu: u32,
    /// Memory in megabytes.
    pub memory_mb: u32,
    /// Zone that earns a scoring bonus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_zone: Option<String>,
}

impl ResourceRequest {
    /// A request without zone preference.
    #[must_use]
    pub const fn new(cpu: u32, memory_mb: u32) -> Self {
        Self {
            cpu,
            memory_mb,
            preferred_zone: None,
        }
    }

    /// Set the preferred zone.
    #[must_use]
    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.preferred_zone = Some(zone.into());
        self
    }
}

impl From<&InstanceSpec> for ResourceRequest {
    fn from(spec: &InstanceSpec) -> Self {
        Self {
            cpu: spec.cpu,
            memory_mb: spec.memory_mb,
            preferred_zone: spec.zone.clone(),
        }
    }
}

/// A host chosen by the placement function, before reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// The chosen host.
    pub host_id: HostId,
    /// Its score for the request.
    pub score: i64,
    /// The host generation the choice was made against.
    pub generation: u64,
}
