//! Per-guest resource files: version-appropriate paths and parsers.
//!
//! Every reader here is best-effort and returns `Option`: a missing or
//! malformed file skips only the metric derived from it, never the guest.

use super::discovery::{GuestScope, IntrospectionRoots};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Resolved accounting-file locations for one guest.
///
/// v2 keeps everything under the guest's unified directory; v1 splits
/// accounting across per-controller hierarchies, reached through the
/// slice-relative subpath.
#[derive(Debug)]
pub(crate) struct GuestPaths {
    pub cpu: PathBuf,
    pub mem_current: PathBuf,
    pub mem_max: PathBuf,
    pub blkio: PathBuf,
    pub procs: PathBuf,
    pub v2: bool,
}

impl GuestPaths {
    pub(crate) fn for_scope(scope: &GuestScope, v2: bool, roots: &IntrospectionRoots) -> Self {
        if v2 {
            return Self {
                cpu: scope.path.join("cpu.stat"),
                mem_current: scope.path.join("memory.current"),
                mem_max: scope.path.join("memory.max"),
                blkio: scope.path.join("io.stat"),
                procs: scope.path.join("cgroup.procs"),
                v2: true,
            };
        }

        let rel = scope.rel_path.clone().unwrap_or_default();
        Self {
            cpu: roots.cgroup.join("cpuacct").join(&rel).join("cpuacct.usage"),
            mem_current: roots.cgroup.join("memory").join(&rel).join("memory.usage_in_bytes"),
            mem_max: roots.cgroup.join("memory").join(&rel).join("memory.limit_in_bytes"),
            blkio: roots
                .cgroup
                .join("blkio")
                .join(&rel)
                .join("blkio.throttle.io_service_bytes"),
            procs: roots.cgroup.join("cpuacct").join(&rel).join("cgroup.procs"),
            v2: false,
        }
    }
}

/// Cumulative CPU usage in seconds, parsed per cgroup version.
pub(crate) async fn read_cpu_usage_seconds(paths: &GuestPaths) -> Option<f64> {
    let content = fs::read_to_string(&paths.cpu).await.ok()?;
    if paths.v2 {
        parse_cpu_stat_usage_seconds(&content)
    } else {
        parse_cpuacct_usage_seconds(&content)
    }
}

/// v2 `cpu.stat`: the `usage_usec` line, in microseconds.
pub(crate) fn parse_cpu_stat_usage_seconds(content: &str) -> Option<f64> {
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        if fields.next() == Some("usage_usec") {
            let value: f64 = fields.next()?.parse().ok()?;
            return Some(value / 1_000_000.0);
        }
    }
    None
}

/// v1 `cpuacct.usage`: a raw nanosecond counter.
pub(crate) fn parse_cpuacct_usage_seconds(content: &str) -> Option<f64> {
    let value: f64 = content.trim().parse().ok()?;
    Some(value / 1_000_000_000.0)
}

/// Memory (used, limit) in bytes; both files must be readable. The
/// `max` sentinel maps the limit to zero, which suppresses limit metrics.
pub(crate) async fn read_mem_usage(paths: &GuestPaths) -> Option<(u64, u64)> {
    let usage = parse_mem_value(&fs::read_to_string(&paths.mem_current).await.ok()?)?;
    let limit = parse_mem_value(&fs::read_to_string(&paths.mem_max).await.ok()?)?;
    Some((usage, limit))
}

pub(crate) fn parse_mem_value(content: &str) -> Option<u64> {
    let value = content.trim();
    if value == "max" {
        return Some(0);
    }
    value.parse().ok()
}

/// Cumulative block I/O (read, write) bytes in the version-appropriate
/// record format.
pub(crate) async fn read_blkio(paths: &GuestPaths) -> Option<(u64, u64)> {
    let content = fs::read_to_string(&paths.blkio).await.ok()?;
    Some(if paths.v2 {
        parse_blkio_v2(&content)
    } else {
        parse_blkio_v1(&content)
    })
}

/// v2 `io.stat`: per-device lines of `key=value` tokens.
pub(crate) fn parse_blkio_v2(content: &str) -> (u64, u64) {
    let mut read = 0u64;
    let mut write = 0u64;
    for token in content.split_whitespace() {
        if let Some(value) = token.strip_prefix("rbytes=") {
            read += value.parse().unwrap_or(0);
        } else if let Some(value) = token.strip_prefix("wbytes=") {
            write += value.parse().unwrap_or(0);
        }
    }
    (read, write)
}

/// v1 `blkio.throttle.io_service_bytes`: fixed-column rows tagged by
/// operation (`<dev> Read <bytes>`).
pub(crate) fn parse_blkio_v1(content: &str) -> (u64, u64) {
    let mut read = 0u64;
    let mut write = 0u64;
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }
        let Ok(value) = fields[2].parse::<u64>() else {
            continue;
        };
        match fields[1].to_ascii_lowercase().as_str() {
            "read" => read += value,
            "write" => write += value,
            _ => {}
        }
    }
    (read, write)
}

/// First process id listed for the guest, falling back to the legacy
/// `tasks` file when `cgroup.procs` is absent.
pub(crate) async fn first_pid(procs: &Path) -> Option<u32> {
    let content = match fs::read_to_string(procs).await {
        Ok(content) => content,
        Err(_) => {
            let legacy = procs.with_file_name("tasks");
            fs::read_to_string(&legacy).await.ok()?
        }
    };
    content
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .find(|pid| *pid > 0)
}

/// Aggregate rx/tx bytes from the process's network-device statistics.
pub(crate) async fn read_net_dev(proc_root: &Path, pid: u32) -> Option<(u64, u64)> {
    let path = proc_root.join(pid.to_string()).join("net").join("dev");
    let content = fs::read_to_string(&path).await.ok()?;
    Some(parse_net_dev(&content))
}

/// `/proc/<pid>/net/dev`: two header lines (containing `|`), then
/// `iface: rx_bytes ... tx_bytes ...` rows; tx bytes is the ninth value.
pub(crate) fn parse_net_dev(content: &str) -> (u64, u64) {
    let mut rx = 0u64;
    let mut tx = 0u64;
    for line in content.lines() {
        let line = line.trim();
        if line.contains('|') || !line.contains(':') {
            continue;
        }
        let Some((_, counters)) = line.split_once(':') else {
            continue;
        };
        let fields: Vec<&str> = counters.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        rx += fields[0].parse::<u64>().unwrap_or(0);
        tx += fields[8].parse::<u64>().unwrap_or(0);
    }
    (rx, tx)
}

/// Uptime of a process in seconds: host uptime minus the process start
/// offset from `/proc/<pid>/stat`.
pub(crate) async fn process_uptime_seconds(
    proc_root: &Path,
    pid: u32,
    clock_ticks: f64,
) -> Option<f64> {
    let uptime_content = fs::read_to_string(proc_root.join("uptime")).await.ok()?;
    let host_uptime: f64 = uptime_content.split_whitespace().next()?.parse().ok()?;

    let stat_content = fs::read_to_string(proc_root.join(pid.to_string()).join("stat"))
        .await
        .ok()?;
    let start_ticks = parse_starttime_ticks(&stat_content)?;

    if clock_ticks <= 0.0 {
        return None;
    }
    Some((host_uptime - start_ticks as f64 / clock_ticks).max(0.0))
}

/// Field 22 of `/proc/<pid>/stat` (start time in clock ticks). The comm
/// field may itself contain spaces, so parsing resumes after the closing
/// parenthesis.
pub(crate) fn parse_starttime_ticks(content: &str) -> Option<u64> {
    let rest = content.rsplit_once(')')?.1;
    rest.split_whitespace().nth(19)?.parse().ok()
}

/// Scheduler clock resolution used for `/proc` start times.
#[cfg(target_os = "linux")]
pub(crate) fn clock_ticks_per_second() -> f64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as f64
    } else {
        100.0
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn clock_ticks_per_second() -> f64 {
    100.0
}
