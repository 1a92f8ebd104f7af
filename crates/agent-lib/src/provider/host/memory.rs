//! Memory and swap sampler.

use super::SOURCE;
use crate::metric::Metric;
use crate::provider::{bail_if_cancelled, Provider};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sysinfo::System;
use tokio_util::sync::CancellationToken;

pub struct MemoryProvider {
    system: System,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn collect(&mut self, cancel: &CancellationToken) -> Result<Vec<Metric>> {
        bail_if_cancelled(cancel)?;
        self.system.refresh_memory();
        let now = Utc::now();

        let total = self.system.total_memory();
        let used = self.system.used_memory();
        let usage_pct = if total > 0 {
            used as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        let mut out = vec![
            Metric::sample("mem", "used", used as f64, "bytes", SOURCE, now),
            Metric::sample("mem", "total", total as f64, "bytes", SOURCE, now),
            Metric::sample("mem", "usage", usage_pct, "pct", SOURCE, now),
        ];

        let swap_total = self.system.total_swap();
        if swap_total > 0 {
            let swap_used = self.system.used_swap();
            out.push(Metric::sample(
                "swap",
                "used",
                swap_used as f64,
                "bytes",
                SOURCE,
                now,
            ));
            out.push(Metric::sample(
                "swap",
                "total",
                swap_total as f64,
                "bytes",
                SOURCE,
                now,
            ));
            out.push(Metric::sample(
                "swap",
                "usage",
                swap_used as f64 / swap_total as f64 * 100.0,
                "pct",
                SOURCE,
                now,
            ));
        }

        Ok(out)
    }
}
