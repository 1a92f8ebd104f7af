//! Collection scheduler.
//!
//! One periodic tick drives one fan-out: every registered provider's
//! `collect` runs as its own task under its own timeout, so a stuck source
//! can neither stall nor fail its siblings. The cycle waits for all tasks,
//! then publishes sequentially in provider-registration order.

use crate::metric::Metric;
use crate::provider::Provider;
use crate::publish::MetricPublisher;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

/// Providers keep internal state across cycles, so each lives behind its own
/// async mutex; cycles never overlap, making the lock uncontended.
type SharedProvider = Arc<AsyncMutex<dyn Provider>>;

pub struct Scheduler {
    providers: Vec<SharedProvider>,
    publisher: Arc<dyn MetricPublisher>,
    interval: Duration,
    provider_timeout: Duration,
}

impl Scheduler {
    pub fn new(publisher: Arc<dyn MetricPublisher>, interval: Duration) -> Self {
        Self {
            providers: Vec::new(),
            publisher,
            interval,
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
        }
    }

    /// Registration order determines publish order within every cycle.
    pub fn register<P: Provider + 'static>(&mut self, provider: P) {
        self.providers.push(Arc::new(AsyncMutex::new(provider)));
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Ceiling for a single provider's `collect`, independent per provider.
    pub fn set_provider_timeout(&mut self, timeout: Duration) {
        self.provider_timeout = timeout;
    }

    /// Loop on a fixed-period timer until cancelled. Cancellation is
    /// observed between ticks; an in-flight cycle finishes its publishes.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            providers = self.providers.len(),
            "starting collection loop"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; consume it so cycles start one
        // full interval after startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("shutting down collection loop");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_cycle(&cancel).await;
                }
            }
        }
    }

    /// Perform exactly one collect-and-publish cycle and return.
    pub async fn run_once(&self, cancel: &CancellationToken) {
        self.run_cycle(cancel).await;
    }

    async fn run_cycle(&self, cancel: &CancellationToken) {
        let started = Instant::now();
        let metrics = self.collect_all(cancel).await;

        let mut publish_failures = 0usize;
        for metric in &metrics {
            if let Err(error) = self.publisher.publish_metric(metric).await {
                publish_failures += 1;
                warn!(
                    device = %metric.device,
                    metric = %metric.name,
                    error = %error,
                    "publish failed"
                );
            }
        }

        debug!(
            metrics = metrics.len(),
            publish_failures,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "collection cycle complete"
        );
    }

    /// Fan out to every provider concurrently and merge the results back
    /// into registration order once all tasks have finished.
    async fn collect_all(&self, cancel: &CancellationToken) -> Vec<Metric> {
        let accumulator: Arc<Mutex<Vec<(usize, Vec<Metric>)>>> =
            Arc::new(Mutex::new(Vec::with_capacity(self.providers.len())));
        let mut tasks = JoinSet::new();

        for (index, provider) in self.providers.iter().enumerate() {
            let provider = Arc::clone(provider);
            let accumulator = Arc::clone(&accumulator);
            let cancel = cancel.clone();
            let timeout = self.provider_timeout;

            tasks.spawn(async move {
                let mut provider = provider.lock().await;
                let name = provider.name().to_string();
                match tokio::time::timeout(timeout, provider.collect(&cancel)).await {
                    Ok(Ok(metrics)) => {
                        if !metrics.is_empty() {
                            accumulator
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .push((index, metrics));
                        }
                    }
                    Ok(Err(error)) => {
                        warn!(provider = %name, error = %error, "provider collection failed");
                    }
                    Err(_) => {
                        warn!(
                            provider = %name,
                            timeout_secs = timeout.as_secs(),
                            "provider collection timed out"
                        );
                    }
                }
            });
        }

        // Cycle barrier: every task finishes (success, error, or timeout)
        // before anything is published.
        while tasks.join_next().await.is_some() {}

        let mut slots = accumulator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect::<Vec<_>>();
        slots.sort_by_key(|(index, _)| *index);
        slots.into_iter().flat_map(|(_, metrics)| metrics).collect()
    }
}
