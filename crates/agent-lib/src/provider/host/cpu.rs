//! Global CPU usage sampler.

use super::SOURCE;
use crate::metric::Metric;
use crate::provider::{bail_if_cancelled, Provider};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sysinfo::System;
use tokio_util::sync::CancellationToken;

pub struct CpuProvider {
    system: System,
}

impl CpuProvider {
    pub fn new() -> Self {
        // Prime the counters so the first cycle has a delta to report.
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self { system }
    }
}

impl Default for CpuProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for CpuProvider {
    fn name(&self) -> &str {
        "cpu"
    }

    async fn collect(&mut self, cancel: &CancellationToken) -> Result<Vec<Metric>> {
        bail_if_cancelled(cancel)?;
        self.system.refresh_cpu_usage();
        let usage = self.system.global_cpu_usage() as f64;
        Ok(vec![Metric::sample(
            "cpu",
            "usage",
            usage,
            "pct",
            SOURCE,
            Utc::now(),
        )])
    }
}
