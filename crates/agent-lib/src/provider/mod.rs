//! Metric providers.
//!
//! Every metric source implements [`Provider`]: a stable name used as the
//! log key, and a `collect` call returning whatever the source could sample
//! this cycle. A provider error means "nothing usable this cycle": the
//! scheduler logs it and the rest of the batch proceeds unaffected.

pub mod docker;
pub mod host;
pub mod proxmox;
mod throttle;

pub use throttle::Throttle;

use crate::metric::Metric;
use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// A unit that samples one metric source and returns a batch per invocation.
///
/// Implementations own their mutable state (throttle clocks, fingerprint and
/// rate caches) exclusively; the scheduler never runs two cycles of the same
/// provider concurrently.
#[async_trait]
pub trait Provider: Send {
    /// Stable name, used as the log and backoff key for the process lifetime.
    fn name(&self) -> &str;

    /// Sample the source. An empty result is a valid outcome (e.g. a
    /// throttled skip); an error contributes zero metrics to the cycle.
    async fn collect(&mut self, cancel: &CancellationToken) -> Result<Vec<Metric>>;
}

/// Fail fast when the cycle was already cancelled before this provider ran.
pub(crate) fn bail_if_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        anyhow::bail!("collection cancelled");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bail_if_cancelled_passes_live_token() {
        let token = CancellationToken::new();
        assert!(bail_if_cancelled(&token).is_ok());
    }

    #[test]
    fn bail_if_cancelled_rejects_cancelled_token() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(bail_if_cancelled(&token).is_err());
    }
}
