//! Live MQTT sink with session presence semantics.
//!
//! On every successful (re)connect a retained "online" status is published
//! to the host status topic, and the broker holds a retained "offline"
//! last-will that fires if the session dies without a clean disconnect.
//! While disconnected, metric publishes are a silent no-op: delivery is
//! best-effort, at-most-once across connection loss.

use super::{encode_payload, encode_status, resolve_topic, MetricPublisher, PublishError};
use crate::metric::Metric;
use crate::publish::topic::render_topic;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_PAUSE: Duration = Duration::from_secs(5);
const DEFAULT_PORT: u16 = 1883;
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Broker address, e.g. `tcp://localhost:1883`.
    pub broker_url: String,
    pub client_id: String,
    pub username: String,
    pub password: String,
    /// Template with `$host`/`$device`/`$metric` placeholders.
    pub topic_template: String,
    /// Template with a `$host` placeholder for presence messages.
    pub status_topic: String,
    pub host: String,
}

pub struct MqttPublisher {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
    topic_template: String,
    host: String,
}

impl MqttPublisher {
    /// Set up the session and spawn the connection driver. The broker may
    /// still be unreachable at return; the driver keeps retrying and
    /// metrics are dropped until the session is up.
    pub fn connect(config: MqttConfig) -> Result<Self> {
        let (broker_host, port) = parse_broker(&config.broker_url)?;

        let mut options = MqttOptions::new(&config.client_id, broker_host, port);
        options.set_keep_alive(KEEP_ALIVE);
        if !config.username.is_empty() {
            options.set_credentials(&config.username, &config.password);
        }

        let status_topic = render_topic(&config.status_topic, &config.host, "", "");
        let offline = encode_status("offline").context("failed to encode offline status")?;
        options.set_last_will(LastWill::new(
            status_topic.clone(),
            offline,
            QoS::AtLeastOnce,
            true,
        ));

        let (client, event_loop) = AsyncClient::new(options, EVENT_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        tokio::spawn(drive_session(
            event_loop,
            client.clone(),
            Arc::clone(&connected),
            status_topic,
            shutdown.clone(),
        ));

        Ok(Self {
            client,
            connected,
            shutdown,
            topic_template: config.topic_template,
            host: config.host,
        })
    }
}

#[async_trait]
impl MetricPublisher for MqttPublisher {
    async fn publish_metric(&self, metric: &Metric) -> Result<(), PublishError> {
        // Lossy while disconnected: nothing is queued or retried.
        if !self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let payload = encode_payload(metric)?;
        let topic = resolve_topic(metric, &self.topic_template, &self.host);
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        // A repeated close finds the session already gone; the error is
        // expected and dropped.
        let _ = self.client.disconnect().await;
        self.shutdown.cancel();
    }
}

/// Poll the event loop for the life of the session: flag connection state,
/// publish the retained online status on each connect, and pace retries
/// after errors.
async fn drive_session(
    mut event_loop: EventLoop,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    status_topic: String,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = event_loop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected.store(true, Ordering::SeqCst);
                info!("mqtt session established");
                match encode_status("online") {
                    Ok(payload) => {
                        if let Err(error) = client
                            .publish(&status_topic, QoS::AtLeastOnce, true, payload)
                            .await
                        {
                            warn!(error = %error, "failed to publish online status");
                        }
                    }
                    Err(error) => warn!(error = %error, "failed to encode online status"),
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                connected.store(false, Ordering::SeqCst);
                break;
            }
            Ok(_) => {}
            Err(error) => {
                if connected.swap(false, Ordering::SeqCst) {
                    warn!(error = %error, "mqtt connection lost");
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_PAUSE) => {}
                }
            }
        }
    }
}

fn parse_broker(broker_url: &str) -> Result<(String, u16)> {
    let url = url::Url::parse(broker_url)
        .with_context(|| format!("invalid broker url {broker_url}"))?;
    let host = url
        .host_str()
        .with_context(|| format!("broker url {broker_url} has no host"))?
        .to_string();
    Ok((host, url.port().unwrap_or(DEFAULT_PORT)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_broker_accepts_tcp_scheme() {
        let (host, port) = parse_broker("tcp://broker.example:1884").unwrap();
        assert_eq!(host, "broker.example");
        assert_eq!(port, 1884);
    }

    #[test]
    fn parse_broker_defaults_port() {
        let (host, port) = parse_broker("mqtt://localhost").unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(port, 1883);
    }

    #[test]
    fn parse_broker_rejects_garbage() {
        assert!(parse_broker("not a url").is_err());
    }

    #[tokio::test]
    async fn disconnected_publish_is_a_silent_noop() {
        let publisher = MqttPublisher::connect(MqttConfig {
            broker_url: "tcp://127.0.0.1:1".to_string(),
            client_id: "test".to_string(),
            username: String::new(),
            password: String::new(),
            topic_template: "metrics/$host/$device/$metric".to_string(),
            status_topic: "status/$host".to_string(),
            host: "h1".to_string(),
        })
        .unwrap();

        // Port 1 refuses immediately; the session never comes up, so the
        // publish is dropped without an error.
        let metric = Metric::sample("cpu", "usage", 1.0, "pct", "sysinfo", chrono::Utc::now());
        assert!(publisher.publish_metric(&metric).await.is_ok());

        publisher.close().await;
        // Close is idempotent.
        publisher.close().await;
    }
}
