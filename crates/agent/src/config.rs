//! Agent configuration.
//!
//! Resolution order, lowest to highest priority: built-in defaults, the
//! optional YAML config file, `AGENT_*` environment variables, then
//! command-line flags (applied in `main`).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// MQTT broker address.
    #[serde(default = "default_broker_url")]
    pub broker_url: String,

    /// MQTT client id; defaults to `telemetry-agent-<host>`.
    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Metric topic template with `$host`/`$device`/`$metric` placeholders.
    #[serde(default = "default_topic_template")]
    pub topic_template: String,

    /// Presence topic template with a `$host` placeholder.
    #[serde(default = "default_status_topic")]
    pub status_topic: String,

    /// Collection cycle period in seconds.
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,

    /// Host identity; defaults to the OS hostname.
    #[serde(default)]
    pub host: String,

    /// Mount points sampled by the disk provider.
    #[serde(default)]
    pub disk_paths: Vec<String>,

    /// Log would-be publishes instead of talking to the broker.
    #[serde(default)]
    pub dry_run: bool,

    /// Enable the local host samplers.
    #[serde(default = "default_true")]
    pub enable_local: bool,

    #[serde(default)]
    pub enable_docker: bool,

    #[serde(default = "default_docker_socket")]
    pub docker_socket: String,

    /// Docker poll cadence; zero polls on every cycle.
    #[serde(default)]
    pub docker_interval_seconds: u64,

    #[serde(default)]
    pub enable_proxmox: bool,

    #[serde(default)]
    pub proxmox_interval_seconds: u64,

    #[serde(default)]
    pub enable_proxmox_api: bool,

    #[serde(default)]
    pub proxmox_api_url: String,

    #[serde(default)]
    pub proxmox_api_node: String,

    #[serde(default)]
    pub proxmox_api_token: String,

    #[serde(default)]
    pub proxmox_api_skip_verify: bool,

    #[serde(default)]
    pub proxmox_api_interval_seconds: u64,
}

fn default_broker_url() -> String {
    "tcp://localhost:1883".to_string()
}

fn default_topic_template() -> String {
    "metrics/$host/$device/$metric".to_string()
}

fn default_status_topic() -> String {
    "status/$host".to_string()
}

fn default_interval() -> u64 {
    10
}

fn default_docker_socket() -> String {
    "/var/run/docker.sock".to_string()
}

fn default_true() -> bool {
    true
}

impl AgentConfig {
    /// Load configuration from the optional file and environment.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("AGENT"))
            .build()
            .context("failed to read configuration")?;

        settings.try_deserialize().context("invalid configuration")
    }

    pub fn interval(&self) -> Duration {
        if self.interval_seconds == 0 {
            Duration::from_secs(default_interval())
        } else {
            Duration::from_secs(self.interval_seconds)
        }
    }

    pub fn docker_interval(&self) -> Option<Duration> {
        interval_from_secs(self.docker_interval_seconds)
    }

    pub fn proxmox_interval(&self) -> Option<Duration> {
        interval_from_secs(self.proxmox_interval_seconds)
    }

    pub fn proxmox_api_interval(&self) -> Option<Duration> {
        interval_from_secs(self.proxmox_api_interval_seconds)
    }
}

fn interval_from_secs(seconds: u64) -> Option<Duration> {
    if seconds == 0 {
        None
    } else {
        Some(Duration::from_secs(seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let config = AgentConfig::load("/nonexistent/agent-config").unwrap();
        assert_eq!(config.broker_url, "tcp://localhost:1883");
        assert_eq!(config.topic_template, "metrics/$host/$device/$metric");
        assert_eq!(config.status_topic, "status/$host");
        assert_eq!(config.interval(), Duration::from_secs(10));
        assert!(config.enable_local);
        assert!(!config.enable_docker);
        assert!(config.docker_interval().is_none());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "broker_url: tcp://broker:1884").unwrap();
        writeln!(file, "interval_seconds: 30").unwrap();
        writeln!(file, "enable_docker: true").unwrap();
        writeln!(file, "docker_interval_seconds: 60").unwrap();

        let config = AgentConfig::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.broker_url, "tcp://broker:1884");
        assert_eq!(config.interval(), Duration::from_secs(30));
        assert!(config.enable_docker);
        assert_eq!(config.docker_interval(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn zero_interval_falls_back_to_default() {
        let mut config = AgentConfig::load("/nonexistent/agent-config").unwrap();
        config.interval_seconds = 0;
        assert_eq!(config.interval(), Duration::from_secs(10));
    }
}
