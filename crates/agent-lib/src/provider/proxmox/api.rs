//! Proxmox VE HTTP API provider.
//!
//! Complements the cgroup introspector with metrics only the hypervisor
//! itself knows: per-guest virtual-disk usage and free-memory figures. The
//! API is polled per node, one guest-list call per guest kind, then one
//! status call per guest.

use crate::metric::Metric;
use crate::provider::{bail_if_cancelled, Provider, Throttle};
use crate::publish::topic::build_topic;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const TOKEN_SCHEME: &str = "PVEAPIToken=";

#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL, e.g. `https://localhost:8006`.
    pub base_url: String,
    /// Node name as known to the cluster.
    pub node: String,
    /// API token (`user@realm!tokenid=secret`).
    pub token: String,
    /// Accept self-signed certificates (common on default installs).
    pub accept_invalid_certs: bool,
}

pub struct ProxmoxApiProvider {
    host: String,
    config: ApiConfig,
    throttle: Throttle,
    client: Option<reqwest::Client>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    data: Vec<GuestEntry>,
}

#[derive(Debug, Deserialize)]
struct GuestEntry {
    vmid: i64,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    data: GuestStatus,
}

#[derive(Debug, Default, Deserialize)]
struct GuestStatus {
    #[serde(default)]
    mem: u64,
    #[serde(default)]
    maxmem: u64,
    #[serde(default)]
    disk: u64,
    #[serde(default)]
    maxdisk: u64,
}

impl ProxmoxApiProvider {
    pub fn new(host: impl Into<String>, config: ApiConfig, interval: Option<Duration>) -> Self {
        Self {
            host: host.into(),
            config,
            throttle: Throttle::new(interval),
            client: None,
        }
    }

    fn ensure_client(&mut self) -> Result<reqwest::Client> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(self.config.accept_invalid_certs)
            .build()
            .context("failed to build hypervisor api client")?;
        self.client = Some(client.clone());
        Ok(client)
    }

    fn auth_header(&self) -> String {
        let token = self.config.token.trim();
        if token.starts_with(TOKEN_SCHEME) {
            token.to_string()
        } else {
            format!("{TOKEN_SCHEME}{token}")
        }
    }

    fn endpoint(&self, suffix: &str) -> String {
        format!(
            "{}/api2/json/nodes/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.node,
            suffix
        )
    }

    async fn list_guests(&self, client: &reqwest::Client, kind: &str) -> Result<Vec<GuestEntry>> {
        let response = client
            .get(self.endpoint(kind))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .with_context(|| format!("hypervisor api {kind} list request failed"))?
            .error_for_status()
            .with_context(|| format!("hypervisor api {kind} list rejected"))?;
        let payload: ListResponse = response
            .json()
            .await
            .with_context(|| format!("hypervisor api {kind} list returned invalid json"))?;
        Ok(payload.data)
    }

    async fn fetch_status(
        &self,
        client: &reqwest::Client,
        kind: &str,
        vmid: i64,
    ) -> Result<GuestStatus> {
        let response = client
            .get(self.endpoint(&format!("{kind}/{vmid}/status/current")))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .context("hypervisor api status request failed")?
            .error_for_status()
            .context("hypervisor api status rejected")?;
        let payload: StatusResponse = response
            .json()
            .await
            .context("hypervisor api status returned invalid json")?;
        Ok(payload.data)
    }

    fn metric(
        &self,
        device: &str,
        name: &str,
        value: f64,
        unit: &str,
        now: DateTime<Utc>,
    ) -> Metric {
        Metric::sample(device, name, value, unit, "proxmox", now)
            .with_topic(build_topic(&["metrics", "proxmox", &self.host, device, name]))
    }

    async fn collect_kind(
        &self,
        client: &reqwest::Client,
        kind: &str,
        guests: &[GuestEntry],
        now: DateTime<Utc>,
        out: &mut Vec<Metric>,
    ) {
        for guest in guests {
            let status = match self.fetch_status(client, kind, guest.vmid).await {
                Ok(status) => status,
                Err(error) => {
                    debug!(kind, vmid = guest.vmid, error = %error, "status fetch failed");
                    continue;
                }
            };

            let device = guest
                .name
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| guest.vmid.to_string());

            if status.maxdisk > 0 {
                let used = status.disk;
                let limit = status.maxdisk;
                let free = limit.saturating_sub(used);
                out.push(self.metric(&device, "disk_used_bytes", used as f64, "bytes", now));
                out.push(self.metric(&device, "disk_limit_bytes", limit as f64, "bytes", now));
                out.push(self.metric(&device, "disk_free_bytes", free as f64, "bytes", now));
                out.push(self.metric(
                    &device,
                    "disk_usage_pct",
                    used as f64 / limit as f64 * 100.0,
                    "pct",
                    now,
                ));
            }

            if status.maxmem > 0 {
                let free = status.maxmem.saturating_sub(status.mem);
                out.push(self.metric(&device, "mem_free_bytes", free as f64, "bytes", now));
            }
        }
    }
}

#[async_trait]
impl Provider for ProxmoxApiProvider {
    fn name(&self) -> &str {
        "proxmox_api"
    }

    async fn collect(&mut self, cancel: &CancellationToken) -> Result<Vec<Metric>> {
        bail_if_cancelled(cancel)?;
        let started = Instant::now();
        if self.throttle.should_skip(started) {
            return Ok(Vec::new());
        }

        let client = match self.ensure_client() {
            Ok(client) => client,
            Err(error) => {
                self.throttle.on_error(started);
                return Err(error);
            }
        };

        let lxc = match self.list_guests(&client, "lxc").await {
            Ok(guests) => guests,
            Err(error) => {
                self.throttle.on_error(started);
                return Err(error);
            }
        };
        let qemu = match self.list_guests(&client, "qemu").await {
            Ok(guests) => guests,
            Err(error) => {
                self.throttle.on_error(started);
                return Err(error);
            }
        };

        let now = Utc::now();
        let mut out = Vec::with_capacity((lxc.len() + qemu.len()) * 5);
        self.collect_kind(&client, "lxc", &lxc, now, &mut out).await;
        self.collect_kind(&client, "qemu", &qemu, now, &mut out).await;

        self.throttle.on_success(started);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(token: &str) -> ProxmoxApiProvider {
        ProxmoxApiProvider::new(
            "h1",
            ApiConfig {
                base_url: "https://pve.local:8006/".to_string(),
                node: "pve".to_string(),
                token: token.to_string(),
                accept_invalid_certs: true,
            },
            None,
        )
    }

    #[test]
    fn auth_header_adds_scheme_once() {
        assert_eq!(
            provider("root@pam!mon=s3cret").auth_header(),
            "PVEAPIToken=root@pam!mon=s3cret"
        );
        assert_eq!(
            provider("PVEAPIToken=root@pam!mon=s3cret").auth_header(),
            "PVEAPIToken=root@pam!mon=s3cret"
        );
    }

    #[test]
    fn endpoint_joins_without_duplicate_slash() {
        let provider = provider("t");
        assert_eq!(
            provider.endpoint("lxc"),
            "https://pve.local:8006/api2/json/nodes/pve/lxc"
        );
        assert_eq!(
            provider.endpoint("qemu/100/status/current"),
            "https://pve.local:8006/api2/json/nodes/pve/qemu/100/status/current"
        );
    }

    #[test]
    fn guest_status_tolerates_missing_fields() {
        let status: StatusResponse =
            serde_json::from_str(r#"{"data":{"mem":1024,"status":"running"}}"#).unwrap();
        assert_eq!(status.data.mem, 1024);
        assert_eq!(status.data.maxdisk, 0);
    }
}
