//! Guest health and readiness probes.

use std::time::Duration;

use async_trait::async_trait;
use minicloud_core::InstanceId;
use tracing::debug;

use crate::error::CollaboratorError;

/// Asks whether an instance is serving.
///
/// `Ok(false)` means "not yet"; the health-check loop probes again after the
/// configured interval. An error is treated like a negative probe.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe the instance at `ip_address`.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe itself could not be carried out.
    async fn probe(&self, instance_id: &InstanceId, ip_address: &str) -> Result<bool, CollaboratorError>;
}

/// Probes `GET http://{ip}:{port}/health`; any 2xx is healthy.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    port: u16,
}

impl HttpHealthProbe {
    /// Create a probe against `port` with a short per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(port: u16) -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()
            .map_err(|e| CollaboratorError::Permanent(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client, port })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, instance_id: &InstanceId, ip_address: &str) -> Result<bool, CollaboratorError> {
        let url = format!("http://{ip_address}:{}/health", self.port);
        match self.client.get(&url).send().await {
            Ok(response) => {
                let healthy = response.status().is_success();
                debug!(%instance_id, status = %response.status(), healthy, "Health probe answered");
                Ok(healthy)
            }
            Err(e) => {
                debug!(%instance_id, url = %url, error = %e, "Health probe unreachable");
                Ok(false)
            }
        }
    }
}

/// Tells whether the guest has started booting.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Whether the instance at `ip_address` has begun its startup sequence.
    ///
    /// # Errors
    ///
    /// Returns an error if readiness cannot be determined.
    async fn ready(&self, instance_id: &InstanceId, ip_address: Option<&str>) -> Result<bool, CollaboratorError>;
}

/// Readiness probe that reports every guest ready.
#[derive(Debug, Clone, Default)]
pub struct PassthroughReadiness;

#[async_trait]
impl ReadinessProbe for PassthroughReadiness {
    async fn ready(&self, _instance_id: &InstanceId, _ip_address: Option<&str>) -> Result<bool, CollaboratorError> {
        Ok(true)
    }
}
