//! Metric envelope shared by every provider and publisher.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// A single sampled value on its way to the publisher.
///
/// `device` + `name` pairs are unique within one provider's output for one
/// cycle; different providers may reuse a name under different devices.
/// When `payload` is set, the publisher serializes it verbatim instead of
/// wrapping `value`/`unit` in the standard envelope. When `topic` is set, it
/// overrides template rendering.
#[derive(Debug, Clone)]
pub struct Metric {
    pub device: String,
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub topic: Option<String>,
    pub payload: Option<Value>,
}

impl Metric {
    /// Numeric sample published under the rendered template topic.
    pub fn sample(
        device: impl Into<String>,
        name: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
        source: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            device: device.into(),
            name: name.into(),
            value,
            unit: unit.into(),
            source: source.into(),
            timestamp,
            topic: None,
            payload: None,
        }
    }

    /// Structured metric whose payload is published as-is.
    pub fn structured(
        device: impl Into<String>,
        name: impl Into<String>,
        payload: Value,
        source: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            device: device.into(),
            name: name.into(),
            value: 0.0,
            unit: String::new(),
            source: source.into(),
            timestamp,
            topic: None,
            payload: Some(payload),
        }
    }

    /// Pin this metric to an explicit topic instead of the template.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sample_has_no_topic_override() {
        let metric = Metric::sample("cpu", "usage", 42.5, "pct", "sysinfo", Utc::now());
        assert!(metric.topic.is_none());
        assert!(metric.payload.is_none());
        assert_eq!(metric.value, 42.5);
    }

    #[test]
    fn with_topic_sets_override() {
        let metric = Metric::structured("web", "$info", json!({"id": "abc"}), "docker", Utc::now())
            .with_topic("metrics/docker/h1/web/$info");
        assert_eq!(metric.topic.as_deref(), Some("metrics/docker/h1/web/$info"));
        assert!(metric.payload.is_some());
    }
}
