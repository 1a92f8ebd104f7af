//! Dry-run sink: logs exactly what the live sink would publish.

use super::{encode_payload, encode_status, resolve_topic, MetricPublisher, PublishError};
use crate::metric::Metric;
use crate::publish::topic::render_topic;
use async_trait::async_trait;
use tracing::{info, warn};

pub struct ConsolePublisher {
    topic_template: String,
    status_topic: String,
    host: String,
}

impl ConsolePublisher {
    pub fn new(topic_template: &str, status_topic: &str, host: &str) -> Self {
        let publisher = Self {
            topic_template: topic_template.to_string(),
            status_topic: render_topic(status_topic, host, "", ""),
            host: host.to_string(),
        };
        // Mirror the live sink's session setup: the registered will and the
        // online announcement.
        publisher.log_status("offline", "will");
        publisher.log_status("online", "publish");
        publisher
    }

    fn log_status(&self, status: &str, kind: &str) {
        match encode_status(status) {
            Ok(payload) => info!(
                kind,
                topic = %self.status_topic,
                payload = %String::from_utf8_lossy(&payload),
                "dry-run status"
            ),
            Err(error) => warn!(error = %error, "failed to encode status payload"),
        }
    }
}

#[async_trait]
impl MetricPublisher for ConsolePublisher {
    async fn publish_metric(&self, metric: &Metric) -> Result<(), PublishError> {
        let payload = encode_payload(metric)?;
        let topic = resolve_topic(metric, &self.topic_template, &self.host);
        info!(
            topic = %topic,
            payload = %String::from_utf8_lossy(&payload),
            "dry-run publish"
        );
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn publish_never_fails_for_numeric_metrics() {
        let publisher = ConsolePublisher::new("metrics/$host/$device/$metric", "status/$host", "h1");
        let metric = Metric::sample("cpu", "usage", 3.5, "pct", "sysinfo", Utc::now());
        assert!(publisher.publish_metric(&metric).await.is_ok());
        publisher.close().await;
    }

    #[test]
    fn status_topic_is_rendered_once() {
        let publisher = ConsolePublisher::new("metrics/$host/$device/$metric", "status/$host", "h 1");
        assert_eq!(publisher.status_topic, "status/h_1");
    }
}
