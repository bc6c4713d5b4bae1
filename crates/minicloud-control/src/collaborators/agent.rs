//! Command channel to the per-host agent.
//!
//! Commands are fire-and-forget: the agent acknowledges receipt and reports
//! completion later by signalling the execution named in the request
//! (`provisioned`, `shutdown_complete`). Every request carries a command ID
//! derived from the activity's idempotency key, so a retried or replayed
//! command is recognisable as a duplicate on the agent side.

use std::time::Duration;

use async_trait::async_trait;
use minicloud_core::{ExecutionId, HostId, IdempotencyKey, InstanceId};
use minicloud_store::InstanceSpec;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::CollaboratorError;

/// What the agent is asked to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentCommand {
    /// Create the VM or container.
    CreateInstance {
        /// Virtual CPUs.
        cpu: u32,
        /// Memory in megabytes.
        memory_mb: u32,
        /// Root disk in gigabytes.
        disk_gb: u32,
        /// Boot image.
        image: String,
        /// Script run on first boot.
        startup_script: String,
    },
    /// Destroy the VM or container and its disk.
    DestroyInstance,
    /// Stop the guest, keeping its disk.
    StopInstance,
    /// Boot a stopped guest.
    StartInstance,
    /// Ask the guest to shut down cleanly.
    ShutdownInstance {
        /// How long the guest has before it is killed.
        grace_seconds: u64,
    },
}

impl AgentCommand {
    /// The create command for a spec.
    #[must_use]
    pub fn create(spec: &InstanceSpec) -> Self {
        Self::CreateInstance {
            cpu: spec.cpu,
            memory_mb: spec.memory_mb,
            disk_gb: spec.disk_gb,
            image: spec.image.clone(),
            startup_script: spec.startup_script.clone(),
        }
    }
}

/// A command addressed to one instance on one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRequest {
    /// Stable across retries and replays of the same activity.
    pub command_id: String,
    /// Execution the agent reports back to.
    pub execution_id: ExecutionId,
    /// Target instance.
    pub instance_id: InstanceId,
    /// The command itself.
    pub command: AgentCommand,
}

impl AgentRequest {
    /// Build a request whose command ID is derived from `key`.
    #[must_use]
    pub fn new(key: &IdempotencyKey, execution_id: &ExecutionId, instance_id: InstanceId, command: AgentCommand) -> Self {
        Self {
            command_id: key.command_id(),
            execution_id: execution_id.clone(),
            instance_id,
            command,
        }
    }
}

/// Trait for host agent communication.
///
/// This trait abstracts the agent transport, allowing for mock
/// implementations in tests.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Deliver a command to the agent on `host_id`.
    ///
    /// # Errors
    ///
    /// Returns `CollaboratorError::Transient` if the agent could not be
    /// reached, `Permanent` if it rejected the command.
    async fn send(&self, host_id: &HostId, request: &AgentRequest) -> Result<(), CollaboratorError>;
}

/// HTTP client for host agents.
///
/// Commands are posted to `{base_url}/v1/hosts/{host_id}/commands`.
#[derive(Debug, Clone)]
pub struct HttpAgentClient {
    client: reqwest::Client,
    base_url: String,
}

/// Error response from an agent.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

impl HttpAgentClient {
    /// Create a new agent client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: impl Into<String>) -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| CollaboratorError::Permanent(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self::with_client(client, base_url))
    }

    /// Create a new agent client with a custom reqwest client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Get the base URL of the agent endpoint.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn send(&self, host_id: &HostId, request: &AgentRequest) -> Result<(), CollaboratorError> {
        let url = format!("{}/v1/hosts/{}/commands", self.base_url, host_id);

        let response = self
            .client
            .post(&url)
            .header("Idempotency-Key", &request.command_id)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        // 409: the agent already holds this command ID.
        if status.is_success() || status == reqwest::StatusCode::CONFLICT {
            debug!(
                host_id = %host_id,
                instance_id = %request.instance_id,
                command_id = %request.command_id,
                "Agent accepted command"
            );
            return Ok(());
        }

        let error = response
            .json::<ErrorResponse>()
            .await
            .map_or_else(|_| format!("Agent returned status {status}"), |e| e.error);

        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            warn!(host_id = %host_id, status = %status, error = %error, "Agent unavailable");
            Err(CollaboratorError::Transient(error))
        } else {
            error!(host_id = %host_id, status = %status, error = %error, "Agent rejected command");
            Err(CollaboratorError::Permanent(error))
        }
    }
}

/// An agent client for when no agent endpoint is configured.
///
/// This client simply logs commands without delivering them.
#[derive(Debug, Clone, Default)]
pub struct NoopAgentClient;

#[async_trait]
impl AgentClient for NoopAgentClient {
    async fn send(&self, host_id: &HostId, request: &AgentRequest) -> Result<(), CollaboratorError> {
        warn!(
            host_id = %host_id,
            instance_id = %request.instance_id,
            command = ?request.command,
            "NoopAgentClient: command dropped, no agent endpoint configured"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> (HostId, AgentRequest) {
        let instance_id = InstanceId::generate();
        let execution_id = ExecutionId::for_provision(&instance_id);
        let key = IdempotencyKey::new(&execution_id, "provision", 0);
        let spec = InstanceSpec::default();
        (
            "host-001".parse().unwrap(),
            AgentRequest::new(&key, &execution_id, instance_id, AgentCommand::create(&spec)),
        )
    }

    #[test]
    fn command_wire_format() {
        let (_, req) = request();
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["command"]["action"], "CREATE_INSTANCE");
        assert_eq!(value["command"]["image"], "ubuntu:22.04");
        assert_eq!(value["command_id"].as_str().unwrap().len(), 32);
    }

    #[tokio::test]
    async fn posts_command_with_idempotency_key() {
        let server = MockServer::start().await;
        let (host_id, req) = request();

        Mock::given(method("POST"))
            .and(path("/v1/hosts/host-001/commands"))
            .and(header("Idempotency-Key", req.command_id.as_str()))
            .and(body_partial_json(serde_json::json!({ "command": { "action": "CREATE_INSTANCE" } })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpAgentClient::new(server.uri()).unwrap();
        client.send(&host_id, &req).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_command_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        let (host_id, req) = request();
        let client = HttpAgentClient::new(server.uri()).unwrap();
        assert!(client.send(&host_id, &req).await.is_ok());
    }

    #[tokio::test]
    async fn server_errors_are_transient_and_rejections_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/hosts/host-001/commands"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/hosts/host-002/commands"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(serde_json::json!({ "error": "unknown image" })),
            )
            .mount(&server)
            .await;

        let (_, req) = request();
        let client = HttpAgentClient::new(server.uri()).unwrap();

        let err = client.send(&"host-001".parse().unwrap(), &req).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Transient(_)));

        let err = client.send(&"host-002".parse().unwrap(), &req).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Permanent(msg) if msg == "unknown image"));
    }

    #[tokio::test]
    async fn unreachable_agent_is_transient() {
        let (host_id, req) = request();
        let client = HttpAgentClient::new("http://127.0.0.1:9").unwrap();
        let err = client.send(&host_id, &req).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Transient(_)));
    }
}
