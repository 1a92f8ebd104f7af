//! Host-wide cumulative disk I/O counters.
//!
//! `sysinfo` exposes no block-device I/O counters, so this reads
//! `/proc/diskstats` directly. Partitions are folded into their parent
//! device (the parent is always listed first) and pseudo devices are
//! ignored.

use super::SOURCE;
use crate::metric::Metric;
use crate::provider::{bail_if_cancelled, Provider};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

const SECTOR_SIZE: u64 = 512;

pub struct DiskIoProvider;

impl DiskIoProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DiskIoProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, PartialEq)]
struct DiskIoTotals {
    read_bytes: u64,
    write_bytes: u64,
    read_ops: u64,
    write_ops: u64,
    read_time_ms: u64,
    write_time_ms: u64,
    io_time_ms: u64,
}

fn is_pseudo_device(name: &str) -> bool {
    ["loop", "ram", "zram", "dm-", "md"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// Sum `/proc/diskstats` over physical devices, skipping partition rows.
fn parse_diskstats(content: &str) -> DiskIoTotals {
    let mut totals = DiskIoTotals::default();
    let mut devices: Vec<String> = Vec::new();

    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 14 {
            continue;
        }
        let name = fields[2];
        if is_pseudo_device(name) {
            continue;
        }
        // sda1 follows sda, nvme0n1p1 follows nvme0n1.
        if devices.iter().any(|device| name.starts_with(device.as_str())) {
            continue;
        }
        devices.push(name.to_string());

        let field = |idx: usize| fields[idx].parse::<u64>().unwrap_or(0);
        totals.read_ops += field(3);
        totals.read_bytes += field(5) * SECTOR_SIZE;
        totals.read_time_ms += field(6);
        totals.write_ops += field(7);
        totals.write_bytes += field(9) * SECTOR_SIZE;
        totals.write_time_ms += field(10);
        totals.io_time_ms += field(12);
    }

    totals
}

/// Read and aggregate the host's block-device counters. Platforms without
/// `/proc/diskstats` report nothing rather than failing every cycle.
#[cfg(target_os = "linux")]
async fn read_diskstats() -> Result<Option<DiskIoTotals>> {
    let content = tokio::fs::read_to_string("/proc/diskstats")
        .await
        .context("failed to read /proc/diskstats")?;
    Ok(Some(parse_diskstats(&content)))
}

#[cfg(not(target_os = "linux"))]
async fn read_diskstats() -> Result<Option<DiskIoTotals>> {
    Ok(None)
}

#[async_trait]
impl Provider for DiskIoProvider {
    fn name(&self) -> &str {
        "diskio"
    }

    async fn collect(&mut self, cancel: &CancellationToken) -> Result<Vec<Metric>> {
        bail_if_cancelled(cancel)?;

        let totals = match read_diskstats().await? {
            Some(totals) => totals,
            None => return Ok(Vec::new()),
        };

        let now = Utc::now();
        Ok(vec![
            Metric::sample("diskio", "read_bytes", totals.read_bytes as f64, "bytes", SOURCE, now),
            Metric::sample("diskio", "write_bytes", totals.write_bytes as f64, "bytes", SOURCE, now),
            Metric::sample("diskio", "read_ops", totals.read_ops as f64, "ops", SOURCE, now),
            Metric::sample("diskio", "write_ops", totals.write_ops as f64, "ops", SOURCE, now),
            Metric::sample("diskio", "read_time_ms", totals.read_time_ms as f64, "ms", SOURCE, now),
            Metric::sample("diskio", "write_time_ms", totals.write_time_ms as f64, "ms", SOURCE, now),
            Metric::sample("diskio", "io_time_ms", totals.io_time_ms as f64, "ms", SOURCE, now),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
   8       0 sda 1000 0 80000 500 2000 0 160000 900 0 700 1400 0 0 0 0
   8       1 sda1 900 0 70000 450 1900 0 150000 850 0 650 1300 0 0 0 0
 259       0 nvme0n1 4000 0 320000 200 8000 0 640000 400 0 300 600 0 0 0 0
 259       1 nvme0n1p1 3900 0 310000 190 7900 0 630000 390 0 290 580 0 0 0 0
   7       0 loop0 50 0 400 1 0 0 0 0 0 1 1 0 0 0 0
";

    #[test]
    fn sums_whole_devices_only() {
        let totals = parse_diskstats(SAMPLE);
        assert_eq!(totals.read_ops, 5000);
        assert_eq!(totals.write_ops, 10000);
        assert_eq!(totals.read_bytes, 400_000 * SECTOR_SIZE);
        assert_eq!(totals.write_bytes, 800_000 * SECTOR_SIZE);
        assert_eq!(totals.read_time_ms, 700);
        assert_eq!(totals.write_time_ms, 1300);
        assert_eq!(totals.io_time_ms, 1000);
    }

    #[test]
    fn short_lines_are_ignored() {
        let totals = parse_diskstats("8 0 sda 1 2 3\n");
        assert_eq!(totals, DiskIoTotals::default());
    }
}
