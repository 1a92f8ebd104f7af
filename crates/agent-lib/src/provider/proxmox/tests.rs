//! Integration tests for guest discovery and metric extraction.
//!
//! These stand up mock cgroup/proc/config trees in a temp directory so the
//! introspector can be exercised without a hypervisor.

use super::{GuestProvider, IntrospectionRoots};
use crate::metric::Metric;
use crate::provider::Provider;
use std::path::Path;
use tempfile::TempDir;
use tokio::fs;
use tokio_util::sync::CancellationToken;

fn roots_in(dir: &TempDir) -> IntrospectionRoots {
    IntrospectionRoots {
        cgroup: dir.path().join("cgroup"),
        proc: dir.path().join("proc"),
        guest_config: dir.path().join("pve"),
    }
}

fn find<'a>(metrics: &'a [Metric], device: &str, name: &str) -> Option<&'a Metric> {
    metrics
        .iter()
        .find(|m| m.device == device && m.name == name)
}

async fn write(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.unwrap();
    }
    fs::write(path, content).await.unwrap();
}

/// One running LXC guest in the canonical v2 machine.slice layout.
async fn create_v2_tree(dir: &TempDir) -> IntrospectionRoots {
    let roots = roots_in(dir);
    let scope = roots
        .cgroup
        .join("machine.slice")
        .join("machine-lxc\\x2d101.scope");

    write(&roots.cgroup.join("cgroup.controllers"), "cpu memory io\n").await;
    write(&scope.join("cpu.stat"), "usage_usec 5000000\nuser_usec 4000000\nsystem_usec 1000000\n").await;
    write(&scope.join("memory.current"), "104857600\n").await;
    write(&scope.join("memory.max"), "max\n").await;
    write(&scope.join("io.stat"), "253:0 rbytes=4096 wbytes=8192 rios=4 wios=8\n").await;
    write(&scope.join("cgroup.procs"), "4321\n").await;

    write(&roots.proc.join("uptime"), "1000.00 500.00\n").await;
    write(
        &roots.proc.join("4321").join("stat"),
        "4321 (lxc init) S 1 4321 4321 0 -1 4194560 100 0 0 0 5 3 0 0 20 0 1 0 50000 1000000 200 18446744073709551615",
    )
    .await;
    write(
        &roots.proc.join("4321").join("net").join("dev"),
        "Inter-|   Receive                                                |  Transmit\n \
         face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n \
         eth0:    6000      50    0    0    0     0          0         0     4000      30    0    0    0     0       0          0\n",
    )
    .await;

    write(
        &roots.guest_config.join("lxc").join("101.conf"),
        "hostname: web\nostype: debian\nmemory: 2048\n",
    )
    .await;

    roots
}

#[tokio::test]
async fn v2_fast_path_extracts_guest_metrics() {
    let dir = TempDir::new().unwrap();
    let roots = create_v2_tree(&dir).await;

    let mut provider = GuestProvider::with_roots("h1", None, roots.clone());
    provider.clock_ticks = 100.0;

    let token = CancellationToken::new();
    let metrics = provider.collect(&token).await.unwrap();

    // Metadata carries the decoded id and the config-derived type tag.
    let info = find(&metrics, "web", "$info").expect("info metric");
    let payload = info.payload.as_ref().unwrap();
    assert_eq!(payload["id"], "101");
    assert_eq!(payload["image"], "debian");
    assert_eq!(
        info.topic.as_deref(),
        Some("metrics/proxmox/h1/web/$info")
    );

    assert_eq!(find(&metrics, "web", "status").unwrap().value, 1.0);

    // starttime 50000 ticks at 100 Hz against 1000s of host uptime.
    let uptime = find(&metrics, "web", "uptime_seconds").unwrap();
    assert!((uptime.value - 500.0).abs() < 1e-6);

    assert_eq!(
        find(&metrics, "web", "mem_used_bytes").unwrap().value,
        104_857_600.0
    );
    // The `max` sentinel suppresses limit and percent.
    assert!(find(&metrics, "web", "mem_limit_bytes").is_none());
    assert!(find(&metrics, "web", "mem_usage_pct").is_none());

    assert_eq!(find(&metrics, "web", "net_rx_bytes").unwrap().value, 6000.0);
    assert_eq!(find(&metrics, "web", "net_tx_bytes").unwrap().value, 4000.0);
    assert_eq!(find(&metrics, "web", "blk_read_bytes").unwrap().value, 4096.0);
    assert_eq!(find(&metrics, "web", "blk_write_bytes").unwrap().value, 8192.0);

    // A newly discovered guest has no prior sample, hence no CPU rate.
    assert!(find(&metrics, "web", "cpu_usage_pct").is_none());
}

#[tokio::test]
async fn second_poll_adds_cpu_rate_and_dedups_info() {
    let dir = TempDir::new().unwrap();
    let roots = create_v2_tree(&dir).await;

    let mut provider = GuestProvider::with_roots("h1", None, roots.clone());
    provider.clock_ticks = 100.0;

    let token = CancellationToken::new();
    let first = provider.collect(&token).await.unwrap();
    assert!(find(&first, "web", "$info").is_some());

    // Usage advanced between polls.
    let scope = roots
        .cgroup
        .join("machine.slice")
        .join("machine-lxc\\x2d101.scope");
    write(&scope.join("cpu.stat"), "usage_usec 6000000\n").await;

    let second = provider.collect(&token).await.unwrap();
    assert!(find(&second, "web", "cpu_usage_pct").is_some());
    // Identical metadata is not re-published.
    assert!(find(&second, "web", "$info").is_none());
}

#[tokio::test]
async fn stopped_guest_reports_status_without_process_metrics() {
    let dir = TempDir::new().unwrap();
    let roots = create_v2_tree(&dir).await;

    let scope = roots
        .cgroup
        .join("machine.slice")
        .join("machine-lxc\\x2d101.scope");
    write(&scope.join("cgroup.procs"), "").await;

    let mut provider = GuestProvider::with_roots("h1", None, roots);
    let token = CancellationToken::new();
    let metrics = provider.collect(&token).await.unwrap();

    assert_eq!(find(&metrics, "web", "status").unwrap().value, 0.0);
    assert!(find(&metrics, "web", "uptime_seconds").is_none());
    assert!(find(&metrics, "web", "net_rx_bytes").is_none());
    // Cgroup accounting still reads fine without a process.
    assert!(find(&metrics, "web", "mem_used_bytes").is_some());
}

#[tokio::test]
async fn v1_legacy_layout_is_discovered() {
    let dir = TempDir::new().unwrap();
    let roots = roots_in(&dir);

    // No cgroup.controllers marker: treated as v1. No machine.slice either,
    // so discovery lands on the per-kind legacy trees.
    let cpuacct = roots.cgroup.join("cpuacct").join("lxc").join("105");
    write(&cpuacct.join("cpuacct.usage"), "7500000000\n").await;
    write(&cpuacct.join("cgroup.procs"), "").await;

    let memory = roots.cgroup.join("memory").join("lxc").join("105");
    write(&memory.join("memory.usage_in_bytes"), "2048\n").await;
    write(&memory.join("memory.limit_in_bytes"), "4096\n").await;

    let blkio = roots.cgroup.join("blkio").join("lxc").join("105");
    write(
        &blkio.join("blkio.throttle.io_service_bytes"),
        "253:0 Read 1024\n253:0 Write 512\nTotal 1536\n",
    )
    .await;

    let mut provider = GuestProvider::with_roots("h1", None, roots);
    let token = CancellationToken::new();
    let metrics = provider.collect(&token).await.unwrap();

    // No config file: the decoded numeric id doubles as the device name.
    assert_eq!(find(&metrics, "105", "status").unwrap().value, 0.0);
    assert_eq!(find(&metrics, "105", "mem_used_bytes").unwrap().value, 2048.0);
    assert_eq!(find(&metrics, "105", "mem_limit_bytes").unwrap().value, 4096.0);
    assert_eq!(find(&metrics, "105", "mem_usage_pct").unwrap().value, 50.0);
    assert_eq!(find(&metrics, "105", "blk_read_bytes").unwrap().value, 1024.0);
    assert_eq!(find(&metrics, "105", "blk_write_bytes").unwrap().value, 512.0);
}

#[tokio::test]
async fn v2_unified_scan_finds_guests_outside_machine_slice() {
    let dir = TempDir::new().unwrap();
    let roots = roots_in(&dir);

    write(&roots.cgroup.join("cgroup.controllers"), "cpu memory io\n").await;
    let scope = roots.cgroup.join("pve.slice").join("qemu-107");
    write(&scope.join("cpu.stat"), "usage_usec 1000000\n").await;
    write(&scope.join("cgroup.procs"), "").await;

    let mut provider = GuestProvider::with_roots("h1", None, roots);
    let token = CancellationToken::new();
    let metrics = provider.collect(&token).await.unwrap();

    assert!(find(&metrics, "107", "status").is_some());
}

#[tokio::test]
async fn unreadable_hierarchy_errors_and_backs_off() {
    let dir = TempDir::new().unwrap();
    let roots = roots_in(&dir);

    let mut provider = GuestProvider::with_roots("h1", None, roots);
    let token = CancellationToken::new();

    assert!(provider.collect(&token).await.is_err());

    // The failure armed the throttle: the immediate retry is a silent skip.
    let skipped = provider.collect(&token).await.unwrap();
    assert!(skipped.is_empty());
}

#[tokio::test]
async fn cancelled_collect_fails_fast() {
    let dir = TempDir::new().unwrap();
    let roots = create_v2_tree(&dir).await;

    let mut provider = GuestProvider::with_roots("h1", None, roots);
    let token = CancellationToken::new();
    token.cancel();

    assert!(provider.collect(&token).await.is_err());
}
