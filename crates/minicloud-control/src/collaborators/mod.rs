//! Interfaces to the systems the orchestrator drives but does not own.
//!
//! Each collaborator is a trait used as `Arc<dyn ...>` so the workflows can
//! be wired against real endpoints in production and against the mocks in
//! `mock` in tests:
//!
//! - [`AgentClient`]: command channel to the per-host agent
//! - [`NetworkAllocator`]: IP and DNS leases
//! - [`HealthProbe`] / [`ReadinessProbe`]: guest liveness checks
//! - [`PolicyGate`]: allow/deny decision before a provision is accepted
//! - [`EventSink`] / [`Notifier`]: downstream consumers of state changes

use std::sync::Arc;

pub mod agent;
pub mod events;
pub mod network;
pub mod policy;
pub mod probe;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use agent::{AgentClient, AgentCommand, AgentRequest, HttpAgentClient, NoopAgentClient};
pub use events::{BroadcastEventSink, EventSink, InstanceStateChanged, LogNotifier, Notifier};
pub use network::{NetworkAllocator, NetworkLease, PoolNetworkAllocator};
pub use policy::{AllowAllPolicy, PolicyDecision, PolicyGate, CREATE_INSTANCE_ACTION};
pub use probe::{HealthProbe, HttpHealthProbe, PassthroughReadiness, ReadinessProbe};

/// The full set of collaborators the orchestrator is wired with.
#[derive(Clone)]
pub struct Collaborators {
    /// Host agent command channel.
    pub agent: Arc<dyn AgentClient>,
    /// IP and DNS assignment.
    pub network: Arc<dyn NetworkAllocator>,
    /// Guest health check.
    pub health: Arc<dyn HealthProbe>,
    /// Guest boot check.
    pub readiness: Arc<dyn ReadinessProbe>,
    /// Admission gate for provision requests.
    pub policy: Arc<dyn PolicyGate>,
    /// State-change event consumer.
    pub events: Arc<dyn EventSink>,
    /// User notifications.
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    /// Collaborators talking to `agent`, with the in-process defaults for
    /// everything else.
    #[must_use]
    pub fn with_agent(agent: Arc<dyn AgentClient>, health: Arc<dyn HealthProbe>) -> Self {
        Self {
            agent,
            network: Arc::new(PoolNetworkAllocator::new("10.0", "minicloud.local")),
            health,
            readiness: Arc::new(PassthroughReadiness),
            policy: Arc::new(AllowAllPolicy),
            events: Arc::new(BroadcastEventSink::default()),
            notifier: Arc::new(LogNotifier),
        }
    }
}
