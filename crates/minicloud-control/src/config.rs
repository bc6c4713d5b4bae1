//! Orchestrator configuration.
//!
//! Every field has a default; `from_env` overrides them from environment
//! variables, and the struct also deserializes from JSON for embedding.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use minicloud_store::Host;
use minicloud_workflow::{EngineConfig, RetryPolicy};
use serde::Deserialize;
use tracing::warn;

use crate::error::{ControlError, Result};
use crate::validation::ValidationRules;
use crate::workflows::LifecycleSettings;

/// Configuration for the orchestrator service.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Listen address (e.g., "0.0.0.0:8080").
    #[serde(default = "OrchestratorConfig::default_listen_addr")]
    pub listen_addr: String,

    /// RocksDB directory.
    #[serde(default = "OrchestratorConfig::default_data_dir")]
    pub data_dir: String,

    /// Base URL of the host agent command endpoint. Commands are only
    /// logged when unset.
    #[serde(default)]
    pub agent_base_url: Option<String>,

    /// JSON file with hosts to register at startup.
    #[serde(default)]
    pub hosts_file: Option<String>,

    /// Maximum non-terminated instances per project.
    #[serde(default = "OrchestratorConfig::default_max_instances")]
    pub max_instances_per_project: u32,

    /// Images instances may boot from.
    #[serde(default = "OrchestratorConfig::default_allowed_images")]
    pub allowed_images: Vec<String>,

    /// SLA used when a spec does not set one, in seconds.
    #[serde(default = "OrchestratorConfig::default_sla_timeout")]
    pub default_sla_timeout_seconds: u64,

    /// Total time a guest has to report healthy, in seconds.
    #[serde(default = "OrchestratorConfig::default_health_check_timeout")]
    pub health_check_timeout_seconds: u64,

    /// Pause between health probes, in seconds.
    #[serde(default = "OrchestratorConfig::default_health_check_interval")]
    pub health_check_interval_seconds: u64,

    /// How long terminate waits for a graceful shutdown, in seconds.
    #[serde(default = "OrchestratorConfig::default_graceful_shutdown")]
    pub graceful_shutdown_seconds: u64,

    /// Port the health probe connects to on the guest.
    #[serde(default = "OrchestratorConfig::default_health_probe_port")]
    pub health_probe_port: u16,

    /// First two octets of leased addresses.
    #[serde(default = "OrchestratorConfig::default_cidr_prefix")]
    pub network_cidr_prefix: String,

    /// Domain appended to instance DNS names.
    #[serde(default = "OrchestratorConfig::default_dns_suffix")]
    pub dns_suffix: String,

    /// Retry policy for activities.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl OrchestratorConfig {
    fn default_listen_addr() -> String {
        "0.0.0.0:8080".to_string()
    }

    fn default_data_dir() -> String {
        "/data".to_string()
    }

    const fn default_max_instances() -> u32 {
        50
    }

    fn default_allowed_images() -> Vec<String> {
        ["ubuntu:22.04", "ubuntu:20.04", "debian:11", "alpine:3.18", "centos:8"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    const fn default_sla_timeout() -> u64 {
        120
    }

    const fn default_health_check_timeout() -> u64 {
        60
    }

    const fn default_health_check_interval() -> u64 {
        5
    }

    const fn default_graceful_shutdown() -> u64 {
        30
    }

    const fn default_health_probe_port() -> u16 {
        80
    }

    fn default_cidr_prefix() -> String {
        "10.0".to_string()
    }

    fn default_dns_suffix() -> String {
        "minicloud.local".to_string()
    }

    /// Defaults overridden by `LISTEN_ADDR`, `DATA_DIR`, `AGENT_BASE_URL`,
    /// `HOSTS_FILE`, `MAX_INSTANCES_PER_PROJECT`, `ALLOWED_IMAGES` (comma
    /// separated), `DEFAULT_SLA_TIMEOUT_SECONDS`,
    /// `HEALTH_CHECK_TIMEOUT_SECONDS`, `HEALTH_CHECK_INTERVAL_SECONDS`,
    /// `GRACEFUL_SHUTDOWN_SECONDS`, `HEALTH_PROBE_PORT`,
    /// `NETWORK_CIDR_PREFIX` and `DNS_SUFFIX`.
    ///
    /// Unparseable numbers are logged and ignored.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("LISTEN_ADDR") {
            config.listen_addr = val;
        }
        if let Ok(val) = std::env::var("DATA_DIR") {
            config.data_dir = val;
        }
        if let Ok(val) = std::env::var("AGENT_BASE_URL") {
            config.agent_base_url = Some(val);
        }
        if let Ok(val) = std::env::var("HOSTS_FILE") {
            config.hosts_file = Some(val);
        }
        if let Ok(val) = std::env::var("ALLOWED_IMAGES") {
            config.allowed_images = parse_list(&val);
        }
        if let Ok(val) = std::env::var("NETWORK_CIDR_PREFIX") {
            config.network_cidr_prefix = val;
        }
        if let Ok(val) = std::env::var("DNS_SUFFIX") {
            config.dns_suffix = val;
        }

        env_number("MAX_INSTANCES_PER_PROJECT", &mut config.max_instances_per_project);
        env_number("DEFAULT_SLA_TIMEOUT_SECONDS", &mut config.default_sla_timeout_seconds);
        env_number("HEALTH_CHECK_TIMEOUT_SECONDS", &mut config.health_check_timeout_seconds);
        env_number("HEALTH_CHECK_INTERVAL_SECONDS", &mut config.health_check_interval_seconds);
        env_number("GRACEFUL_SHUTDOWN_SECONDS", &mut config.graceful_shutdown_seconds);
        env_number("HEALTH_PROBE_PORT", &mut config.health_probe_port);

        config
    }

    /// Get the default SLA as a `Duration`.
    #[must_use]
    pub const fn default_sla(&self) -> Duration {
        Duration::from_secs(self.default_sla_timeout_seconds)
    }

    /// Get the graceful shutdown window as a `Duration`.
    #[must_use]
    pub const fn graceful_shutdown(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_seconds)
    }

    /// Rules for the provision workflow's validate step.
    #[must_use]
    pub fn validation_rules(&self) -> ValidationRules {
        ValidationRules {
            allowed_images: self.allowed_images.clone(),
            max_instances_per_project: self.max_instances_per_project,
        }
    }

    /// Timing and limits for the workflows.
    #[must_use]
    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            rules: self.validation_rules(),
            health_check_timeout: Duration::from_secs(self.health_check_timeout_seconds),
            health_check_interval: Duration::from_secs(self.health_check_interval_seconds),
            graceful_shutdown: self.graceful_shutdown(),
        }
    }

    /// Engine tuning.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            retry: self.retry.clone(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            listen_addr: Self::default_listen_addr(),
            data_dir: Self::default_data_dir(),
            agent_base_url: None,
            hosts_file: None,
            max_instances_per_project: Self::default_max_instances(),
            allowed_images: Self::default_allowed_images(),
            default_sla_timeout_seconds: Self::default_sla_timeout(),
            health_check_timeout_seconds: Self::default_health_check_timeout(),
            health_check_interval_seconds: Self::default_health_check_interval(),
            graceful_shutdown_seconds: Self::default_graceful_shutdown(),
            health_probe_port: Self::default_health_probe_port(),
            network_cidr_prefix: Self::default_cidr_prefix(),
            dns_suffix: Self::default_dns_suffix(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Read a host inventory: a JSON array of hosts.
///
/// # Errors
///
/// Returns `ControlError::BadRequest` if the file cannot be read or parsed.
pub fn load_hosts(path: impl AsRef<Path>) -> Result<Vec<Host>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ControlError::BadRequest(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&raw).map_err(|e| ControlError::BadRequest(format!("invalid hosts file {}: {e}", path.display())))
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn env_number<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(val) = std::env::var(name) {
        match val.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(name, value = %val, "Ignoring unparseable setting"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.data_dir, "/data");
        assert_eq!(config.max_instances_per_project, 50);
        assert_eq!(config.allowed_images.len(), 5);
        assert!(config.allowed_images.contains(&"ubuntu:22.04".to_string()));
        assert_eq!(config.health_probe_port, 80);
        assert!(config.agent_base_url.is_none());
    }

    #[test]
    fn timeout_duration() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.default_sla(), Duration::from_secs(120));
        assert_eq!(config.graceful_shutdown(), Duration::from_secs(30));

        let settings = config.lifecycle_settings();
        assert_eq!(settings.health_check_timeout, Duration::from_secs(60));
        assert_eq!(settings.health_check_interval, Duration::from_secs(5));
        assert_eq!(settings.health_check_attempts(), 12);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{ "listen_addr": "127.0.0.1:9000", "allowed_images": ["debian:12"] }"#).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.validation_rules().allowed_images, vec!["debian:12".to_string()]);
        assert_eq!(config.default_sla_timeout_seconds, 120);
        assert_eq!(config.engine_config().retry, RetryPolicy::default());
    }

    #[test]
    fn image_list_parsing() {
        assert_eq!(
            parse_list(" ubuntu:22.04, debian:11 ,,alpine:3.18"),
            vec!["ubuntu:22.04", "debian:11", "alpine:3.18"]
        );
    }

    #[test]
    fn hosts_file_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"id":"host-001","name":"rack1-a","zone":"zone-a","cpu_total":32,"cpu_allocated":0,"memory_total_mb":65536,"memory_allocated_mb":0}}]"#
        )
        .unwrap();

        let hosts = load_hosts(file.path()).unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].cpu_total, 32);
        assert_eq!(hosts[0].zone, "zone-a");

        assert!(matches!(load_hosts("/nonexistent/hosts.json"), Err(ControlError::BadRequest(_))));
    }
}
