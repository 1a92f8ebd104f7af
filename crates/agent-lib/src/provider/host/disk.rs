//! Disk capacity sampler, aggregated over configured mount paths.

use super::SOURCE;
use crate::metric::Metric;
use crate::provider::{bail_if_cancelled, Provider};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use sysinfo::Disks;
use tokio_util::sync::CancellationToken;

pub struct DiskProvider {
    paths: Vec<PathBuf>,
    disks: Disks,
}

impl DiskProvider {
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            disks: Disks::new_with_refreshed_list(),
        }
    }
}

#[async_trait]
impl Provider for DiskProvider {
    fn name(&self) -> &str {
        "disk"
    }

    async fn collect(&mut self, cancel: &CancellationToken) -> Result<Vec<Metric>> {
        bail_if_cancelled(cancel)?;
        if self.paths.is_empty() {
            anyhow::bail!("disk paths not configured");
        }

        self.disks.refresh_list();

        let mut total = 0u64;
        let mut used = 0u64;
        let mut matched = false;
        for disk in self.disks.list() {
            if self.paths.iter().any(|path| path == disk.mount_point()) {
                matched = true;
                total += disk.total_space();
                used += disk.total_space().saturating_sub(disk.available_space());
            }
        }

        if !matched {
            anyhow::bail!("no disk usage data available for configured paths");
        }

        let usage_pct = if total > 0 {
            used as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        let now = Utc::now();
        Ok(vec![
            Metric::sample("disk", "used", used as f64, "bytes", SOURCE, now),
            Metric::sample("disk", "total", total as f64, "bytes", SOURCE, now),
            Metric::sample("disk", "usage", usage_pct, "pct", SOURCE, now),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_path_list_is_an_error() {
        let token = CancellationToken::new();
        let mut provider = DiskProvider::new(Vec::<PathBuf>::new());
        assert!(provider.collect(&token).await.is_err());
    }

    #[tokio::test]
    async fn unmatched_path_is_an_error() {
        let token = CancellationToken::new();
        let mut provider = DiskProvider::new(vec!["/definitely/not/a/mount/point"]);
        assert!(provider.collect(&token).await.is_err());
    }
}
