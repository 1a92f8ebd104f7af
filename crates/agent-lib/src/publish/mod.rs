//! Metric publishing.
//!
//! Two interchangeable sinks share [`MetricPublisher`]: the live MQTT
//! publisher and a console sink for dry runs. Topic resolution and payload
//! encoding live here so both sinks produce identical output for a given
//! metric.

pub mod console;
pub mod mqtt;
pub mod topic;

pub use console::ConsolePublisher;
pub use mqtt::{MqttConfig, MqttPublisher};

use crate::metric::Metric;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;

/// A failed publish affects one metric only; the scheduler logs it and
/// carries on with the rest of the batch.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("mqtt publish failed: {0}")]
    Transport(#[from] rumqttc::ClientError),
}

#[async_trait]
pub trait MetricPublisher: Send + Sync {
    /// Publish one metric. Best-effort: a disconnected live sink drops the
    /// metric silently rather than queueing it.
    async fn publish_metric(&self, metric: &Metric) -> Result<(), PublishError>;

    /// Tear down the session. Idempotent; safe to call more than once.
    async fn close(&self);
}

/// Standard numeric envelope for metrics without a structured payload.
#[derive(Debug, Serialize)]
struct MetricPayload<'a> {
    value: f64,
    ts: i64,
    unit: &'a str,
    source: &'a str,
}

/// Presence payload for the host status topic.
#[derive(Debug, Serialize)]
struct StatusPayload<'a> {
    status: &'a str,
    ts: i64,
}

/// Serialize the metric's structured payload as-is, or wrap the numeric
/// value in the standard envelope.
pub(crate) fn encode_payload(metric: &Metric) -> Result<Vec<u8>, serde_json::Error> {
    match &metric.payload {
        Some(value) => serde_json::to_vec(value),
        None => serde_json::to_vec(&MetricPayload {
            value: metric.value,
            ts: metric.timestamp.timestamp_millis(),
            unit: &metric.unit,
            source: &metric.source,
        }),
    }
}

pub(crate) fn encode_status(status: &str) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&StatusPayload {
        status,
        ts: Utc::now().timestamp_millis(),
    })
}

/// The metric's explicit topic wins; otherwise render the template.
pub(crate) fn resolve_topic(metric: &Metric, template: &str, host: &str) -> String {
    match &metric.topic {
        Some(explicit) => explicit.clone(),
        None => topic::render_topic(template, host, &metric.device, &metric.name),
    }
}
