//! Host telemetry collection engine.
//!
//! This crate provides the core functionality for:
//! - The provider contract and per-cycle concurrent scheduler
//! - Container introspection over the Docker engine socket
//! - Hypervisor guest introspection via the cgroup hierarchy and the
//!   hypervisor HTTP API
//! - One-shot host samplers (CPU, memory, disk, network, sensors)
//! - Metric publishing over MQTT, with a console sink for dry runs

pub mod metric;
pub mod provider;
pub mod publish;
pub mod scheduler;

pub use metric::Metric;
pub use provider::Provider;
pub use publish::{ConsolePublisher, MetricPublisher, MqttConfig, MqttPublisher};
pub use scheduler::Scheduler;
