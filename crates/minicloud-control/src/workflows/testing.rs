//! Wiring shared by the workflow tests: a temporary store, one host, mock
//! collaborators and an engine with the four workflows registered.

use std::sync::{Arc, Weak};
use std::time::Duration;

use minicloud_core::{ExecutionId, InstanceId};
use minicloud_scheduler::HostRegistry;
use minicloud_store::{Host, InstanceRecord, InstanceSpec, InstanceState, RocksStore, Store};
use minicloud_workflow::{Engine, ExecutionSnapshot};
use serde_json::json;
use tempfile::TempDir;

use super::{
    register_workflows, Lifecycle, LifecycleSettings, OperationInput, ProvisionInput, PROVISION,
    PROVISIONED_SIGNAL, SHUTDOWN_COMPLETE_SIGNAL,
};
use crate::collaborators::mock::{MockAgent, MockHealthProbe, MockNetwork, RecordingEventSink, RecordingNotifier};
use crate::collaborators::{AgentCommand, AgentRequest, AllowAllPolicy, Collaborators, PassthroughReadiness};
use crate::validation::ValidationRules;

pub(crate) const HOST_CPU: u32 = 16;
pub(crate) const HOST_MEMORY_MB: u32 = 32_768;

pub(crate) struct Harness {
    _dir: TempDir,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) hosts: Arc<HostRegistry>,
    pub(crate) agent: Arc<MockAgent>,
    pub(crate) network: Arc<MockNetwork>,
    pub(crate) health: Arc<MockHealthProbe>,
    pub(crate) events: Arc<RecordingEventSink>,
    pub(crate) notifier: Arc<RecordingNotifier>,
    pub(crate) lifecycle: Arc<Lifecycle>,
    pub(crate) engine: Arc<Engine>,
}

pub(crate) fn settings() -> LifecycleSettings {
    LifecycleSettings {
        rules: ValidationRules {
            allowed_images: vec!["ubuntu:22.04".to_string(), "debian:12".to_string()],
            max_instances_per_project: 50,
        },
        health_check_timeout: Duration::from_secs(60),
        health_check_interval: Duration::from_secs(5),
        graceful_shutdown: Duration::from_secs(30),
    }
}

pub(crate) fn spec(name: &str) -> InstanceSpec {
    InstanceSpec {
        name: name.to_string(),
        project_id: "proj-1".to_string(),
        ..InstanceSpec::default()
    }
}

/// Play the agent's side: report `provisioned` after a create and
/// `shutdown_complete` after a graceful shutdown.
fn answer(engine: &Weak<Engine>, request: &AgentRequest) {
    let Some(engine) = engine.upgrade() else {
        return;
    };
    let (signal, payload) = match request.command {
        AgentCommand::CreateInstance { .. } => (PROVISIONED_SIGNAL, json!({ "bootLogs": "cloud-init finished" })),
        AgentCommand::ShutdownInstance { .. } => (SHUTDOWN_COMPLETE_SIGNAL, json!({})),
        _ => return,
    };
    engine.signal(&request.execution_id, signal, payload).unwrap();
}

impl Harness {
    /// Agent that answers every command.
    pub(crate) fn new(health: MockHealthProbe) -> Self {
        Self::build(health, true)
    }

    /// Agent that accepts commands but never reports back.
    pub(crate) fn silent_agent(health: MockHealthProbe) -> Self {
        Self::build(health, false)
    }

    fn build(health: MockHealthProbe, agent_answers: bool) -> Self {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn Store> = Arc::new(RocksStore::open(dir.path()).unwrap());
        let hosts = Arc::new(HostRegistry::load(store.clone()).unwrap());
        hosts
            .register_host(Host::new(
                "host-001".parse().unwrap(),
                "host-001",
                "zone-a",
                HOST_CPU,
                HOST_MEMORY_MB,
            ))
            .unwrap();

        let agent = Arc::new(MockAgent::new());
        let network = Arc::new(MockNetwork::new());
        let health = Arc::new(health);
        let events = Arc::new(RecordingEventSink::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let collaborators = Collaborators {
            agent: agent.clone(),
            network: network.clone(),
            health: health.clone(),
            readiness: Arc::new(PassthroughReadiness),
            policy: Arc::new(AllowAllPolicy),
            events: events.clone(),
            notifier: notifier.clone(),
        };
        let lifecycle = Arc::new(Lifecycle::new(store.clone(), hosts.clone(), collaborators, settings()));
        let engine = Arc::new(register_workflows(Engine::builder(store.clone()), &lifecycle).build());

        if agent_answers {
            let weak = Arc::downgrade(&engine);
            agent.on_send(move |_, request| answer(&weak, request));
        }

        Self {
            _dir: dir,
            store,
            hosts,
            agent,
            network,
            health,
            events,
            notifier,
            lifecycle,
            engine,
        }
    }

    pub(crate) fn create(&self, spec: &InstanceSpec) -> InstanceId {
        let id = InstanceId::generate();
        self.lifecycle.create(id, spec.clone()).unwrap();
        id
    }

    pub(crate) async fn provision(&self, spec: InstanceSpec) -> (InstanceId, ExecutionSnapshot) {
        let id = self.create(&spec);
        let execution_id = ExecutionId::for_provision(&id);
        let sla = Duration::from_secs(spec.sla_timeout_seconds);
        let input = serde_json::to_value(ProvisionInput { instance_id: id, spec }).unwrap();
        self.engine
            .start(PROVISION, execution_id.clone(), input, sla)
            .unwrap();
        (id, self.engine.wait(&execution_id).await.unwrap())
    }

    pub(crate) async fn run(&self, workflow_type: &str, id: InstanceId, force: bool) -> ExecutionSnapshot {
        let execution_id = ExecutionId::for_operation(&id, workflow_type);
        let input = serde_json::to_value(OperationInput { instance_id: id, force }).unwrap();
        self.engine
            .start(workflow_type, execution_id.clone(), input, Duration::from_secs(300))
            .unwrap();
        self.engine.wait(&execution_id).await.unwrap()
    }

    pub(crate) fn record(&self, id: &InstanceId) -> InstanceRecord {
        self.store.get_instance(id).unwrap().unwrap()
    }

    /// Every state the instance has been in, oldest first.
    pub(crate) fn states(&self, id: &InstanceId) -> Vec<InstanceState> {
        self.store
            .list_events(id, 1000)
            .unwrap()
            .into_iter()
            .map(|e| e.to_state)
            .collect()
    }

    pub(crate) fn host_allocated(&self) -> (u32, u32) {
        let host = self.hosts.get_host(&"host-001".parse().unwrap()).unwrap();
        (host.cpu_allocated, host.memory_allocated_mb)
    }
}
