//! Host-wide cumulative network I/O counters.

use super::SOURCE;
use crate::metric::Metric;
use crate::provider::{bail_if_cancelled, Provider};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sysinfo::Networks;
use tokio_util::sync::CancellationToken;

pub struct NetIoProvider {
    networks: Networks,
}

impl NetIoProvider {
    pub fn new() -> Self {
        Self {
            networks: Networks::new_with_refreshed_list(),
        }
    }
}

impl Default for NetIoProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for NetIoProvider {
    fn name(&self) -> &str {
        "netio"
    }

    async fn collect(&mut self, cancel: &CancellationToken) -> Result<Vec<Metric>> {
        bail_if_cancelled(cancel)?;
        self.networks.refresh_list();

        let mut rx_bytes = 0u64;
        let mut tx_bytes = 0u64;
        let mut rx_packets = 0u64;
        let mut tx_packets = 0u64;
        let mut rx_errors = 0u64;
        let mut tx_errors = 0u64;
        for (_name, data) in self.networks.iter() {
            rx_bytes += data.total_received();
            tx_bytes += data.total_transmitted();
            rx_packets += data.total_packets_received();
            tx_packets += data.total_packets_transmitted();
            rx_errors += data.total_errors_on_received();
            tx_errors += data.total_errors_on_transmitted();
        }

        let now = Utc::now();
        Ok(vec![
            Metric::sample("net", "bytes_in", rx_bytes as f64, "bytes", SOURCE, now),
            Metric::sample("net", "bytes_out", tx_bytes as f64, "bytes", SOURCE, now),
            Metric::sample("net", "packets_in", rx_packets as f64, "packets", SOURCE, now),
            Metric::sample("net", "packets_out", tx_packets as f64, "packets", SOURCE, now),
            Metric::sample("net", "errors_in", rx_errors as f64, "count", SOURCE, now),
            Metric::sample("net", "errors_out", tx_errors as f64, "count", SOURCE, now),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emits_aggregate_counters() {
        let token = CancellationToken::new();
        let mut provider = NetIoProvider::new();
        let metrics = provider.collect(&token).await.unwrap();
        assert_eq!(metrics.len(), 6);
        assert!(metrics.iter().all(|m| m.device == "net"));
    }
}
