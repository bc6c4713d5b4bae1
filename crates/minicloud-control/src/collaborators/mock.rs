//! Mock collaborators for testing.
//!
//! Each mock records what it was asked to do and can be told to fail, so
//! workflow tests can drive every branch without real agents or networks.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use minicloud_core::{HostId, InstanceId};
use minicloud_store::InstanceSpec;
use parking_lot::Mutex;

use super::agent::{AgentClient, AgentCommand, AgentRequest};
use super::events::{EventSink, InstanceStateChanged, Notifier};
use super::network::{NetworkAllocator, NetworkLease, PoolNetworkAllocator};
use super::policy::{PolicyDecision, PolicyGate};
use super::probe::HealthProbe;
use crate::error::CollaboratorError;

type SendHook = Arc<dyn Fn(&HostId, &AgentRequest) + Send + Sync>;

/// Agent that records every command.
///
/// A hook set with [`MockAgent::on_send`] runs after each accepted command;
/// tests use it to play the agent's side, e.g. signalling `provisioned`.
#[derive(Default)]
pub struct MockAgent {
    requests: Mutex<Vec<(HostId, AgentRequest)>>,
    fail_with: Mutex<Option<CollaboratorError>>,
    hook: Mutex<Option<SendHook>>,
}

impl MockAgent {
    /// Create a mock agent that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following send fail with `error`.
    pub fn fail_with(&self, error: CollaboratorError) {
        *self.fail_with.lock() = Some(error);
    }

    /// Accept commands again.
    pub fn recover(&self) {
        *self.fail_with.lock() = None;
    }

    /// Run `hook` after every accepted command.
    pub fn on_send<F>(&self, hook: F)
    where
        F: Fn(&HostId, &AgentRequest) + Send + Sync + 'static,
    {
        *self.hook.lock() = Some(Arc::new(hook));
    }

    /// Every accepted command, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<(HostId, AgentRequest)> {
        self.requests.lock().clone()
    }

    /// Accepted commands matching `pred`.
    #[must_use]
    pub fn count(&self, pred: impl Fn(&AgentCommand) -> bool) -> usize {
        self.requests.lock().iter().filter(|(_, r)| pred(&r.command)).count()
    }
}

#[async_trait]
impl AgentClient for MockAgent {
    async fn send(&self, host_id: &HostId, request: &AgentRequest) -> Result<(), CollaboratorError> {
        if let Some(error) = self.fail_with.lock().clone() {
            return Err(error);
        }
        self.requests.lock().push((host_id.clone(), request.clone()));
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook(host_id, request);
        }
        Ok(())
    }
}

/// Network allocator over a real pool that can be told to fail.
pub struct MockNetwork {
    pool: PoolNetworkAllocator,
    fail_allocate: AtomicBool,
    released: Mutex<Vec<InstanceId>>,
}

impl MockNetwork {
    /// Create a mock over a `10.0.x.y` pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pool: PoolNetworkAllocator::new("10.0", "minicloud.local"),
            fail_allocate: AtomicBool::new(false),
            released: Mutex::new(Vec::new()),
        }
    }

    /// Make allocation fail permanently.
    pub fn fail_allocations(&self) {
        self.fail_allocate.store(true, Ordering::SeqCst);
    }

    /// Instances whose leases were released.
    #[must_use]
    pub fn released(&self) -> Vec<InstanceId> {
        self.released.lock().clone()
    }

    /// Number of leases currently held.
    #[must_use]
    pub fn active_leases(&self) -> usize {
        self.pool.active_leases()
    }
}

impl Default for MockNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkAllocator for MockNetwork {
    async fn allocate(&self, instance_id: &InstanceId, segment: &str) -> Result<NetworkLease, CollaboratorError> {
        if self.fail_allocate.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Permanent(format!("segment {segment} unavailable")));
        }
        self.pool.allocate(instance_id, segment).await
    }

    async fn release(&self, instance_id: &InstanceId) -> Result<(), CollaboratorError> {
        self.released.lock().push(*instance_id);
        self.pool.release(instance_id).await
    }
}

/// Health probe that turns healthy on a given attempt, or never.
pub struct MockHealthProbe {
    healthy_on: Option<u32>,
    attempts: AtomicU32,
    probed: Mutex<HashSet<String>>,
}

impl MockHealthProbe {
    /// Healthy from the `attempt`-th probe on (1-based).
    #[must_use]
    pub fn healthy_on(attempt: u32) -> Self {
        Self {
            healthy_on: Some(attempt),
            attempts: AtomicU32::new(0),
            probed: Mutex::new(HashSet::new()),
        }
    }

    /// Never healthy.
    #[must_use]
    pub fn never() -> Self {
        Self {
            healthy_on: None,
            attempts: AtomicU32::new(0),
            probed: Mutex::new(HashSet::new()),
        }
    }

    /// Number of probes made so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Addresses that were probed.
    #[must_use]
    pub fn probed_addresses(&self) -> HashSet<String> {
        self.probed.lock().clone()
    }
}

#[async_trait]
impl HealthProbe for MockHealthProbe {
    async fn probe(&self, _instance_id: &InstanceId, ip_address: &str) -> Result<bool, CollaboratorError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.probed.lock().insert(ip_address.to_string());
        Ok(self.healthy_on.is_some_and(|n| attempt >= n))
    }
}

/// Policy gate that denies everything.
#[derive(Debug, Clone)]
pub struct DenyPolicy(pub String);

impl PolicyGate for DenyPolicy {
    fn evaluate(&self, _action: &str, _spec: &InstanceSpec) -> PolicyDecision {
        PolicyDecision::Deny(self.0.clone())
    }
}

/// Event sink that keeps every event.
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<InstanceStateChanged>>,
}

impl RecordingEventSink {
    /// Everything published so far.
    #[must_use]
    pub fn events(&self) -> Vec<InstanceStateChanged> {
        self.events.lock().clone()
    }
}

impl EventSink for RecordingEventSink {
    fn publish(&self, event: &InstanceStateChanged) {
        self.events.lock().push(event.clone());
    }
}

/// Notifier that keeps every notification.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, InstanceId, String)>>,
}

impl RecordingNotifier {
    /// `(channel, instance, message)` of every notification.
    #[must_use]
    pub fn sent(&self) -> Vec<(String, InstanceId, String)> {
        self.sent.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, channel: &str, instance_id: &InstanceId, message: &str) {
        self.sent
            .lock()
            .push((channel.to_string(), *instance_id, message.to_string()));
    }
}
