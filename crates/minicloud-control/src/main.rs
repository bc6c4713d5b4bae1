//! Minicloud Orchestrator - Instance Lifecycle Service
//!
//! This is the main entry point for the orchestrator. It resumes unfinished
//! workflows from the store, then serves the HTTP API.

use std::sync::Arc;

use minicloud_control::collaborators::{
    AgentClient, AllowAllPolicy, BroadcastEventSink, Collaborators, HttpAgentClient, HttpHealthProbe, LogNotifier,
    NoopAgentClient, PassthroughReadiness, PoolNetworkAllocator,
};
use minicloud_control::{config, create_router, OrchestratorConfig, OrchestratorService};
use minicloud_scheduler::HostRegistry;
use minicloud_store::{RocksStore, Store};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,minicloud=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Minicloud Orchestrator");

    let config = OrchestratorConfig::from_env();

    // Initialize store
    let store: Arc<dyn Store> = Arc::new(RocksStore::open(&config.data_dir)?);
    tracing::info!(data_dir = %config.data_dir, "Initialized RocksDB store");

    let hosts = Arc::new(HostRegistry::load(store.clone())?);
    if let Some(path) = &config.hosts_file {
        for host in config::load_hosts(path)? {
            let host = hosts.register_host(host)?;
            tracing::info!(host_id = %host.id, zone = %host.zone, "Registered host from inventory");
        }
    }

    let agent: Arc<dyn AgentClient> = if let Some(base_url) = &config.agent_base_url {
        tracing::info!(agent_base_url = %base_url, "Using HTTP agent client");
        Arc::new(HttpAgentClient::new(base_url.clone())?)
    } else {
        tracing::warn!("AGENT_BASE_URL not set, agent commands are only logged");
        Arc::new(NoopAgentClient)
    };

    // Leases live in memory; rebuild them from the addresses live instances hold.
    let network = PoolNetworkAllocator::new(config.network_cidr_prefix.clone(), config.dns_suffix.clone());
    network.restore(&store.list_instances()?);

    let collaborators = Collaborators {
        agent,
        network: Arc::new(network),
        health: Arc::new(HttpHealthProbe::new(config.health_probe_port)?),
        readiness: Arc::new(PassthroughReadiness),
        policy: Arc::new(AllowAllPolicy),
        events: Arc::new(BroadcastEventSink::default()),
        notifier: Arc::new(LogNotifier),
    };

    let service = Arc::new(OrchestratorService::new(store, hosts, collaborators, &config));

    let report = service.recover()?;
    tracing::info!(
        resumed = report.resumed.len(),
        quarantined = report.quarantined.len(),
        "Recovered unfinished workflows"
    );

    let app = create_router(service.clone());

    // Start server
    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app).await?;

    service.shutdown().await;
    Ok(())
}
