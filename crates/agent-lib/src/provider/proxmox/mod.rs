//! Hypervisor guest introspection.
//!
//! Discovers LXC containers and QEMU virtual machines through the host's
//! control-group hierarchy, reads each guest's resource-accounting files,
//! and derives per-guest metrics. Discovery tolerates the layout variance
//! between cgroup versions and tooling generations; per-guest extraction is
//! best-effort so one missing file never costs the rest of the guest's
//! metrics, and an unreadable hierarchy only costs this poll.

mod api;
mod cgroupfs;
mod discovery;

#[cfg(test)]
mod tests;

pub use api::{ApiConfig, ProxmoxApiProvider};
pub use discovery::{GuestKind, GuestScope, IntrospectionRoots};

use crate::metric::Metric;
use crate::provider::{bail_if_cancelled, Provider, Throttle};
use crate::publish::topic::build_topic;
use anyhow::Result;
use async_trait::async_trait;
use cgroupfs::GuestPaths;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub struct GuestProvider {
    host: String,
    throttle: Throttle,
    roots: IntrospectionRoots,
    cpu_count: usize,
    clock_ticks: f64,
    /// Guest name -> metadata fingerprint; entries are never removed.
    info_cache: HashMap<String, String>,
    /// Guest id -> previous cumulative CPU sample for rate computation.
    prev_cpu: HashMap<String, CpuSample>,
}

struct CpuSample {
    usage_seconds: f64,
    sampled_at: Instant,
}

impl GuestProvider {
    pub fn new(host: impl Into<String>, interval: Option<Duration>) -> Self {
        Self::with_roots(host, interval, IntrospectionRoots::default())
    }

    /// Construct against explicit filesystem roots (used by tests).
    pub fn with_roots(
        host: impl Into<String>,
        interval: Option<Duration>,
        roots: IntrospectionRoots,
    ) -> Self {
        Self {
            host: host.into(),
            throttle: Throttle::new(interval),
            roots,
            cpu_count: std::thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(1),
            clock_ticks: cgroupfs::clock_ticks_per_second(),
            info_cache: HashMap::new(),
            prev_cpu: HashMap::new(),
        }
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

    /// Record this cycle's sample and derive a usage percentage against the
    /// previous one. A newly seen guest id yields nothing.
    fn cpu_percent(&mut self, id: &str, usage_seconds: f64, now: Instant) -> Option<f64> {
        let prev = self.prev_cpu.insert(
            id.to_string(),
            CpuSample {
                usage_seconds,
                sampled_at: now,
            },
        )?;
        let elapsed = now.duration_since(prev.sampled_at).as_secs_f64();
        usage_rate_percent(usage_seconds - prev.usage_seconds, elapsed, self.cpu_count)
    }

    fn info_changed(&mut self, name: &str, fingerprint: &str) -> bool {
        if self.info_cache.get(name).map(String::as_str) == Some(fingerprint) {
            return false;
        }
        self.info_cache.insert(name.to_string(), fingerprint.to_string());
        true
    }

    async fn collect_guest(
        &mut self,
        scope: &GuestScope,
        v2: bool,
        now: DateTime<Utc>,
        sampled_at: Instant,
        out: &mut Vec<Metric>,
    ) {
        let device = if scope.name.is_empty() {
            scope.id.clone()
        } else {
            scope.name.clone()
        };

        let fingerprint = format!("{}|{}|", scope.id, scope.ostype);
        if self.info_changed(&device, &fingerprint) {
            out.push(
                Metric::structured(
                    &device,
                    "$info",
                    json!({ "id": scope.id, "image": scope.ostype, "created": "" }),
                    "proxmox",
                    now,
                )
                .with_topic(build_topic(&[
                    "metrics", "proxmox", &self.host, &device, "$info",
                ])),
            );
        }

        let paths = GuestPaths::for_scope(scope, v2, &self.roots);

        let pid = cgroupfs::first_pid(&paths.procs).await;
        out.push(self.metric(
            &device,
            "status",
            if pid.is_some() { 1.0 } else { 0.0 },
            "bool",
            now,
        ));

        if let Some(pid) = pid {
            if let Some(uptime) =
                cgroupfs::process_uptime_seconds(&self.roots.proc, pid, self.clock_ticks).await
            {
                out.push(self.metric(&device, "uptime_seconds", uptime, "seconds", now));
            }
        }

        if let Some(usage_seconds) = cgroupfs::read_cpu_usage_seconds(&paths).await {
            if let Some(pct) = self.cpu_percent(&scope.id, usage_seconds, sampled_at) {
                out.push(self.metric(&device, "cpu_usage_pct", pct, "pct", now));
            }
        }

        if let Some((used, limit)) = cgroupfs::read_mem_usage(&paths).await {
            out.push(self.metric(&device, "mem_used_bytes", used as f64, "bytes", now));
            if limit > 0 {
                out.push(self.metric(&device, "mem_limit_bytes", limit as f64, "bytes", now));
                out.push(self.metric(
                    &device,
                    "mem_usage_pct",
                    used as f64 / limit as f64 * 100.0,
                    "pct",
                    now,
                ));
            }
        }

        if let Some(pid) = pid {
            if let Some((rx, tx)) = cgroupfs::read_net_dev(&self.roots.proc, pid).await {
                out.push(self.metric(&device, "net_rx_bytes", rx as f64, "bytes", now));
                out.push(self.metric(&device, "net_tx_bytes", tx as f64, "bytes", now));
            }
        }

        if let Some((read, write)) = cgroupfs::read_blkio(&paths).await {
            out.push(self.metric(&device, "blk_read_bytes", read as f64, "bytes", now));
            out.push(self.metric(&device, "blk_write_bytes", write as f64, "bytes", now));
        }
    }
}

#[async_trait]
impl Provider for GuestProvider {
    fn name(&self) -> &str {
        "proxmox"
    }

    async fn collect(&mut self, cancel: &CancellationToken) -> Result<Vec<Metric>> {
        bail_if_cancelled(cancel)?;
        let sampled_at = Instant::now();
        if self.throttle.should_skip(sampled_at) {
            return Ok(Vec::new());
        }

        let (scopes, v2) = match discovery::find_guest_scopes(&self.roots).await {
            Ok(found) => found,
            Err(error) => {
                self.throttle.on_error(sampled_at);
                return Err(error);
            }
        };

        let now = Utc::now();
        let mut out = Vec::with_capacity(scopes.len() * 6);
        for scope in &scopes {
            self.collect_guest(scope, v2, now, sampled_at, &mut out).await;
        }

        self.throttle.on_success(sampled_at);
        Ok(out)
    }
}

/// Instantaneous usage percentage from a cumulative-seconds delta,
/// normalized by the host's logical CPU count. Non-positive deltas yield
/// nothing rather than a fabricated value.
fn usage_rate_percent(delta_usage: f64, delta_secs: f64, cpu_count: usize) -> Option<f64> {
    if delta_usage <= 0.0 || delta_secs <= 0.0 {
        return None;
    }
    Some(delta_usage / delta_secs * 100.0 / cpu_count.max(1) as f64)
}

#[cfg(test)]
mod rate_tests {
    use super::*;

    #[test]
    fn rate_normalizes_by_cpu_count() {
        // 5 CPU-seconds over 10 wall seconds on a 4-core host.
        assert_eq!(usage_rate_percent(5.0, 10.0, 4), Some(12.5));
    }

    #[test]
    fn rate_requires_positive_deltas() {
        assert!(usage_rate_percent(0.0, 10.0, 4).is_none());
        assert!(usage_rate_percent(-1.0, 10.0, 4).is_none());
        assert!(usage_rate_percent(5.0, 0.0, 4).is_none());
    }

    #[test]
    fn first_observation_yields_no_rate() {
        let mut provider = GuestProvider::new("h1", None);
        provider.cpu_count = 4;

        let now = Instant::now();
        assert!(provider.cpu_percent("101", 100.0, now).is_none());

        // A second sample ten seconds later with a five-second usage delta.
        let later = now + Duration::from_secs(10);
        let pct = provider.cpu_percent("101", 105.0, later).unwrap();
        assert!((pct - 12.5).abs() < 1e-9);

        // A different guest id starts its own history.
        assert!(provider.cpu_percent("102", 50.0, later).is_none());
    }
}
