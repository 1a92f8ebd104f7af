//! Docker container introspection.
//!
//! Talks to the local engine over its unix socket: lists every container
//! (stopped ones included) and, for running containers, pulls a one-shot
//! stats snapshot to derive CPU, memory, network, and block-I/O metrics.
//! Slow-changing container metadata is fingerprinted so it is only
//! re-published when it actually changes.

use crate::metric::Metric;
use crate::provider::{bail_if_cancelled, Provider, Throttle};
use crate::publish::topic::build_topic;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{ListContainersOptions, Stats, StatsOptions};
use bollard::models::ContainerSummary;
use bollard::Docker;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use futures_util::StreamExt;
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DEFAULT_SOCKET: &str = "/var/run/docker.sock";
const API_TIMEOUT_SECS: u64 = 8;

pub struct DockerProvider {
    socket: String,
    host: String,
    throttle: Throttle,
    /// Built lazily; dropped on failure so the next poll reconnects fresh.
    client: Option<Docker>,
    /// Container name -> metadata fingerprint. Entries are never removed;
    /// stale names are harmless.
    info_cache: HashMap<String, String>,
}

impl DockerProvider {
    pub fn new(
        socket: impl Into<String>,
        host: impl Into<String>,
        interval: Option<Duration>,
    ) -> Self {
        Self {
            socket: socket.into(),
            host: host.into(),
            throttle: Throttle::new(interval),
            client: None,
            info_cache: HashMap::new(),
        }
    }

    fn ensure_client(&mut self) -> Result<Docker> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        let socket = match self.socket.trim() {
            "" => DEFAULT_SOCKET,
            path => path,
        };
        let client = Docker::connect_with_unix(socket, API_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            .with_context(|| format!("failed to open docker socket {socket}"))?;
        self.client = Some(client.clone());
        Ok(client)
    }

    /// Record the fingerprint and report whether it changed for this name.
    fn info_changed(&mut self, name: &str, fingerprint: &str) -> bool {
        if self.info_cache.get(name).map(String::as_str) == Some(fingerprint) {
            return false;
        }
        self.info_cache.insert(name.to_string(), fingerprint.to_string());
        true
    }

    fn metric(
        &self,
        device: &str,
        name: &str,
        value: f64,
        unit: &str,
        now: DateTime<Utc>,
    ) -> Metric {
        Metric::sample(device, name, value, unit, "docker", now)
            .with_topic(build_topic(&["metrics", "docker", &self.host, device, name]))
    }

    async fn collect_container(
        &mut self,
        client: &Docker,
        container: &ContainerSummary,
        now: DateTime<Utc>,
        out: &mut Vec<Metric>,
    ) {
        let id = container.id.clone().unwrap_or_default();
        let name = match container_name(container) {
            Some(name) => name,
            None => id.clone(),
        };
        if name.is_empty() {
            return;
        }

        let image = container.image.clone().unwrap_or_default();
        let created_at = container
            .created
            .filter(|secs| *secs > 0)
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
        let created_iso = created_at
            .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default();

        let fingerprint = format!("{id}|{image}|{created_iso}");
        if self.info_changed(&name, &fingerprint) {
            out.push(
                Metric::structured(
                    &name,
                    "$info",
                    json!({ "id": id, "image": image, "created": created_iso }),
                    "docker",
                    now,
                )
                .with_topic(build_topic(&["metrics", "docker", &self.host, &name, "$info"])),
            );
        }

        let running = matches!(container.state.as_deref(), Some(state) if state.eq_ignore_ascii_case("running"));
        out.push(self.metric(&name, "status", if running { 1.0 } else { 0.0 }, "bool", now));

        if let Some(created_at) = created_at {
            let uptime = (now - created_at).num_milliseconds() as f64 / 1000.0;
            out.push(self.metric(&name, "uptime_seconds", uptime, "seconds", now));
        }

        // Stopped containers get metadata/status/uptime only.
        if !running {
            return;
        }

        let stats = match fetch_stats(client, &id).await {
            Ok(stats) => stats,
            Err(error) => {
                debug!(container = %name, error = %error, "stats fetch failed");
                return;
            }
        };

        let percpu_len = stats
            .cpu_stats
            .cpu_usage
            .percpu_usage
            .as_ref()
            .map_or(0, Vec::len);
        if let Some(pct) = cpu_percent(
            stats.cpu_stats.cpu_usage.total_usage,
            stats.precpu_stats.cpu_usage.total_usage,
            stats.cpu_stats.system_cpu_usage,
            stats.precpu_stats.system_cpu_usage,
            percpu_len,
            stats.cpu_stats.online_cpus,
        ) {
            out.push(self.metric(&name, "cpu_usage_pct", pct, "pct", now));
        }

        let mem_used = stats.memory_stats.usage.unwrap_or(0) as f64;
        out.push(self.metric(&name, "mem_used_bytes", mem_used, "bytes", now));
        if let Some(limit) = stats.memory_stats.limit.filter(|limit| *limit > 0) {
            let limit = limit as f64;
            out.push(self.metric(&name, "mem_limit_bytes", limit, "bytes", now));
            out.push(self.metric(&name, "mem_usage_pct", mem_used / limit * 100.0, "pct", now));
        }

        let (rx, tx) = net_totals(&stats);
        out.push(self.metric(&name, "net_rx_bytes", rx as f64, "bytes", now));
        out.push(self.metric(&name, "net_tx_bytes", tx as f64, "bytes", now));

        let (blk_read, blk_write) = blkio_totals(
            stats
                .blkio_stats
                .io_service_bytes_recursive
                .iter()
                .flatten()
                .map(|entry| (entry.op.as_str(), entry.value)),
        );
        out.push(self.metric(&name, "blk_read_bytes", blk_read as f64, "bytes", now));
        out.push(self.metric(&name, "blk_write_bytes", blk_write as f64, "bytes", now));
    }
}

#[async_trait]
impl Provider for DockerProvider {
    fn name(&self) -> &str {
        "docker"
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

        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let containers = match client.list_containers(Some(options)).await {
            Ok(containers) => containers,
            Err(error) => {
                self.throttle.on_error(started);
                // Force a fresh connection on the next poll.
                self.client = None;
                return Err(error).context("docker container listing failed");
            }
        };

        let now = Utc::now();
        let mut out = Vec::with_capacity(containers.len() * 6);
        for container in &containers {
            self.collect_container(&client, container, now, &mut out).await;
        }

        self.throttle.on_success(started);
        Ok(out)
    }
}

async fn fetch_stats(client: &Docker, id: &str) -> Result<Stats> {
    let options = StatsOptions {
        stream: false,
        one_shot: false,
    };
    let mut stream = client.stats(id, Some(options));
    match stream.next().await {
        Some(Ok(stats)) => Ok(stats),
        Some(Err(error)) => Err(error).context("docker stats request failed"),
        None => anyhow::bail!("docker stats stream ended without a sample"),
    }
}

/// First listed name, without the leading slash the engine prepends.
fn container_name(container: &ContainerSummary) -> Option<String> {
    let name = container.names.as_ref()?.first()?.trim();
    let name = name.strip_prefix('/').unwrap_or(name);
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// CPU percentage from the engine's paired current/previous counters.
///
/// Online CPU count prefers the per-CPU usage array length, then the
/// reported online count, then one. A non-positive delta on either side
/// yields no value at all rather than a fabricated zero.
fn cpu_percent(
    total_usage: u64,
    pre_total_usage: u64,
    system_usage: Option<u64>,
    pre_system_usage: Option<u64>,
    percpu_len: usize,
    online_cpus: Option<u64>,
) -> Option<f64> {
    let cpu_delta = total_usage as f64 - pre_total_usage as f64;
    let system_delta = system_usage? as f64 - pre_system_usage? as f64;
    if cpu_delta <= 0.0 || system_delta <= 0.0 {
        return None;
    }

    let cpus = if percpu_len > 0 {
        percpu_len as f64
    } else {
        match online_cpus {
            Some(count) if count > 0 => count as f64,
            _ => 1.0,
        }
    };

    Some(cpu_delta / system_delta * cpus * 100.0)
}

fn net_totals(stats: &Stats) -> (u64, u64) {
    let mut rx = 0u64;
    let mut tx = 0u64;
    for network in stats.networks.iter().flat_map(HashMap::values) {
        rx += network.rx_bytes;
        tx += network.tx_bytes;
    }
    (rx, tx)
}

/// Sum cumulative per-operation byte counts, keeping reads and writes.
fn blkio_totals<'a>(entries: impl Iterator<Item = (&'a str, u64)>) -> (u64, u64) {
    let mut read = 0u64;
    let mut write = 0u64;
    for (op, value) in entries {
        if op.eq_ignore_ascii_case("read") {
            read += value;
        } else if op.eq_ignore_ascii_case("write") {
            write += value;
        }
    }
    (read, write)
}
