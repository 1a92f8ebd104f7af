//! Host telemetry agent.
//!
//! Samples hardware, OS, container, and virtual-machine metrics on a fixed
//! cycle and publishes them over MQTT (or to the log in dry-run mode).

use agent_lib::provider::docker::DockerProvider;
use agent_lib::provider::host::{
    CpuProvider, DiskIoProvider, DiskProvider, MemoryProvider, NetIoProvider, SystemProvider,
    TempsProvider,
};
use agent_lib::provider::proxmox::{ApiConfig, GuestProvider, ProxmoxApiProvider};
use agent_lib::{ConsolePublisher, MetricPublisher, MqttConfig, MqttPublisher, Scheduler};
use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

use config::AgentConfig;

#[derive(Parser, Debug)]
#[command(
    name = "telemetry-agent",
    about = "Host telemetry agent publishing metrics over MQTT"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "config.yaml")]
    config: String,

    /// MQTT broker url
    #[arg(long)]
    broker: Option<String>,

    /// MQTT client id
    #[arg(long)]
    client_id: Option<String>,

    /// MQTT username
    #[arg(long)]
    username: Option<String>,

    /// MQTT password
    #[arg(long)]
    password: Option<String>,

    /// Metric topic template
    #[arg(long)]
    topic_template: Option<String>,

    /// Status topic template
    #[arg(long)]
    status_topic: Option<String>,

    /// Collection interval in seconds
    #[arg(long)]
    interval: Option<u64>,

    /// Host identity override
    #[arg(long)]
    host: Option<String>,

    /// Comma-separated mount points for the disk provider
    #[arg(long, value_delimiter = ',')]
    disk_paths: Option<Vec<String>>,

    /// Log would-be publishes instead of connecting to the broker
    #[arg(long)]
    dry_run: bool,

    /// Run one dry-run collection cycle and exit
    #[arg(long)]
    dry_run_once: bool,

    /// Disable the local host samplers
    #[arg(long)]
    disable_local: bool,

    /// Enable docker container metrics
    #[arg(long)]
    enable_docker: bool,

    /// Docker socket path
    #[arg(long)]
    docker_socket: Option<String>,

    /// Docker poll interval in seconds
    #[arg(long)]
    docker_interval: Option<u64>,

    /// Enable hypervisor guest metrics from the cgroup hierarchy
    #[arg(long)]
    enable_proxmox: bool,

    /// Guest poll interval in seconds
    #[arg(long)]
    proxmox_interval: Option<u64>,

    /// Enable hypervisor API metrics
    #[arg(long)]
    enable_proxmox_api: bool,

    /// Hypervisor API base url (e.g. https://localhost:8006)
    #[arg(long)]
    proxmox_api_url: Option<String>,

    /// Hypervisor API node name
    #[arg(long)]
    proxmox_api_node: Option<String>,

    /// Hypervisor API token (user@realm!tokenid=secret)
    #[arg(long)]
    proxmox_api_token: Option<String>,

    /// Skip hypervisor API TLS verification
    #[arg(long)]
    proxmox_api_skip_verify: bool,

    /// Hypervisor API poll interval in seconds
    #[arg(long)]
    proxmox_api_interval: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut cfg = AgentConfig::load(&cli.config)?;
    apply_overrides(&mut cfg, &cli);

    if cfg.host.is_empty() {
        cfg.host = hostname::get()
            .context("hostname lookup failed")?
            .to_string_lossy()
            .into_owned();
    }
    if cfg.client_id.is_empty() {
        cfg.client_id = format!("telemetry-agent-{}", cfg.host);
    }
    if cfg.disk_paths.is_empty() {
        cfg.disk_paths = default_disk_paths();
    }

    info!(
        host = %cfg.host,
        interval_secs = cfg.interval().as_secs(),
        dry_run = cfg.dry_run,
        "agent configured"
    );

    let publisher: Arc<dyn MetricPublisher> = if cfg.dry_run {
        Arc::new(ConsolePublisher::new(
            &cfg.topic_template,
            &cfg.status_topic,
            &cfg.host,
        ))
    } else {
        Arc::new(
            MqttPublisher::connect(MqttConfig {
                broker_url: cfg.broker_url.clone(),
                client_id: cfg.client_id.clone(),
                username: cfg.username.clone(),
                password: cfg.password.clone(),
                topic_template: cfg.topic_template.clone(),
                status_topic: cfg.status_topic.clone(),
                host: cfg.host.clone(),
            })
            .context("mqtt session setup failed")?,
        )
    };

    let scheduler = build_scheduler(&cfg, Arc::clone(&publisher));
    info!(providers = scheduler.provider_count(), "providers assembled");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            wait_for_shutdown().await;
            info!("shutdown signal received");
            cancel.cancel();
        });
    }

    if cli.dry_run_once {
        scheduler.run_once(&cancel).await;
    } else {
        scheduler.run(cancel.clone()).await;
    }

    publisher.close().await;
    Ok(())
}

fn build_scheduler(cfg: &AgentConfig, publisher: Arc<dyn MetricPublisher>) -> Scheduler {
    let mut scheduler = Scheduler::new(publisher, cfg.interval());

    if cfg.enable_local {
        scheduler.register(CpuProvider::new());
        scheduler.register(MemoryProvider::new());
        scheduler.register(DiskProvider::new(cfg.disk_paths.clone()));
        scheduler.register(DiskIoProvider::new());
        scheduler.register(NetIoProvider::new());
        scheduler.register(SystemProvider::new());
        scheduler.register(TempsProvider::new());
    }

    if cfg.enable_docker {
        scheduler.register(DockerProvider::new(
            &cfg.docker_socket,
            &cfg.host,
            cfg.docker_interval(),
        ));
    }

    if cfg.enable_proxmox {
        scheduler.register(GuestProvider::new(&cfg.host, cfg.proxmox_interval()));
    }

    if cfg.enable_proxmox_api {
        if cfg.proxmox_api_url.is_empty()
            || cfg.proxmox_api_node.is_empty()
            || cfg.proxmox_api_token.is_empty()
        {
            warn!("hypervisor api enabled but url/node/token incomplete; skipping provider");
        } else {
            scheduler.register(ProxmoxApiProvider::new(
                &cfg.host,
                ApiConfig {
                    base_url: cfg.proxmox_api_url.clone(),
                    node: cfg.proxmox_api_node.clone(),
                    token: cfg.proxmox_api_token.clone(),
                    accept_invalid_certs: cfg.proxmox_api_skip_verify,
                },
                cfg.proxmox_api_interval(),
            ));
        }
    }

    scheduler
}

fn apply_overrides(cfg: &mut AgentConfig, cli: &Cli) {
    if let Some(broker) = &cli.broker {
        cfg.broker_url = broker.clone();
    }
    if let Some(client_id) = &cli.client_id {
        cfg.client_id = client_id.clone();
    }
    if let Some(username) = &cli.username {
        cfg.username = username.clone();
    }
    if let Some(password) = &cli.password {
        cfg.password = password.clone();
    }
    if let Some(template) = &cli.topic_template {
        cfg.topic_template = template.clone();
    }
    if let Some(status_topic) = &cli.status_topic {
        cfg.status_topic = status_topic.clone();
    }
    if let Some(interval) = cli.interval {
        if interval > 0 {
            cfg.interval_seconds = interval;
        }
    }
    if let Some(host) = &cli.host {
        cfg.host = host.clone();
    }
    if let Some(paths) = &cli.disk_paths {
        cfg.disk_paths = paths
            .iter()
            .map(|path| path.trim().to_string())
            .filter(|path| !path.is_empty())
            .collect();
    }
    if cli.dry_run || cli.dry_run_once {
        cfg.dry_run = true;
    }
    if cli.disable_local {
        cfg.enable_local = false;
    }
    if cli.enable_docker {
        cfg.enable_docker = true;
    }
    if let Some(socket) = &cli.docker_socket {
        cfg.docker_socket = socket.clone();
    }
    if let Some(interval) = cli.docker_interval {
        cfg.docker_interval_seconds = interval;
    }
    if cli.enable_proxmox {
        cfg.enable_proxmox = true;
    }
    if let Some(interval) = cli.proxmox_interval {
        cfg.proxmox_interval_seconds = interval;
    }
    if cli.enable_proxmox_api {
        cfg.enable_proxmox_api = true;
    }
    if let Some(url) = &cli.proxmox_api_url {
        cfg.proxmox_api_url = url.clone();
    }
    if let Some(node) = &cli.proxmox_api_node {
        cfg.proxmox_api_node = node.clone();
    }
    if let Some(token) = &cli.proxmox_api_token {
        cfg.proxmox_api_token = token.clone();
    }
    if cli.proxmox_api_skip_verify {
        cfg.proxmox_api_skip_verify = true;
    }
    if let Some(interval) = cli.proxmox_api_interval {
        cfg.proxmox_api_interval_seconds = interval;
    }
}

fn default_disk_paths() -> Vec<String> {
    if cfg!(windows) {
        vec!["C:\\".to_string()]
    } else {
        vec!["/".to_string()]
    }
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(error) => {
            warn!(error = %error, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
