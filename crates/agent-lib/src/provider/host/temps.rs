//! Temperature sensor sampler.
//!
//! Platforms without exposed sensors yield an empty component list, which
//! makes this a no-op provider there.

use super::SOURCE;
use crate::metric::Metric;
use crate::provider::{bail_if_cancelled, Provider};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sysinfo::Components;
use tokio_util::sync::CancellationToken;

pub struct TempsProvider {
    components: Components,
}

impl TempsProvider {
    pub fn new() -> Self {
        Self {
            components: Components::new_with_refreshed_list(),
        }
    }
}

impl Default for TempsProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for TempsProvider {
    fn name(&self) -> &str {
        "temps"
    }

    async fn collect(&mut self, cancel: &CancellationToken) -> Result<Vec<Metric>> {
        bail_if_cancelled(cancel)?;
        self.components.refresh_list();

        let now = Utc::now();
        let out = self
            .components
            .iter()
            .map(|component| {
                Metric::sample(
                    "temps",
                    component.label(),
                    component.temperature() as f64,
                    "C",
                    SOURCE,
                    now,
                )
            })
            .collect();

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collect_never_errors_without_sensors() {
        let token = CancellationToken::new();
        let mut provider = TempsProvider::new();
        // Sensor availability varies by host; the call itself must succeed.
        assert!(provider.collect(&token).await.is_ok());
    }
}
