//! Load, uptime, and process-count sampler.

use super::SOURCE;
use crate::metric::Metric;
use crate::provider::{bail_if_cancelled, Provider};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sysinfo::{ProcessesToUpdate, System};
use tokio_util::sync::CancellationToken;

pub struct SystemProvider {
    system: System,
}

impl SystemProvider {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SystemProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for SystemProvider {
    fn name(&self) -> &str {
        "system"
    }

    async fn collect(&mut self, cancel: &CancellationToken) -> Result<Vec<Metric>> {
        bail_if_cancelled(cancel)?;
        let now = Utc::now();
        let mut out = Vec::with_capacity(6);

        let load = System::load_average();
        out.push(Metric::sample("system", "load1", load.one, "load", SOURCE, now));
        out.push(Metric::sample("system", "load5", load.five, "load", SOURCE, now));
        out.push(Metric::sample("system", "load15", load.fifteen, "load", SOURCE, now));

        out.push(Metric::sample(
            "system",
            "uptime",
            System::uptime() as f64,
            "seconds",
            SOURCE,
            now,
        ));
        out.push(Metric::sample(
            "system",
            "boot_time",
            System::boot_time() as f64,
            "unix_seconds",
            SOURCE,
            now,
        ));

        self.system.refresh_processes(ProcessesToUpdate::All);
        out.push(Metric::sample(
            "system",
            "processes",
            self.system.processes().len() as f64,
            "count",
            SOURCE,
            now,
        ));

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emits_expected_metric_names() {
        let token = CancellationToken::new();
        let mut provider = SystemProvider::new();
        let metrics = provider.collect(&token).await.unwrap();
        let names: Vec<_> = metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["load1", "load5", "load15", "uptime", "boot_time", "processes"]
        );
    }
}
