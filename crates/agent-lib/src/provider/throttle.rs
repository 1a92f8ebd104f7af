//! Admission gate for providers polling expensive or flaky sources.

use std::time::{Duration, Instant};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Skip-until-ready gate in front of a provider's real work.
///
/// The scheduler invokes every provider on each cheap outer tick; a gated
/// provider answers with an empty skip while `now < next_allowed`. A success
/// reschedules at the configured interval (or leaves the provider always
/// eligible when none is set). Each consecutive failure doubles the backoff,
/// capped at one minute, and `next_allowed` only moves forward until a
/// success resets it.
#[derive(Debug)]
pub struct Throttle {
    interval: Option<Duration>,
    next_allowed: Option<Instant>,
    backoff: Duration,
}

impl Throttle {
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            interval,
            next_allowed: None,
            backoff: Duration::ZERO,
        }
    }

    /// True while the source should not be polled yet. A skip is not an
    /// error: the provider returns no metrics and the cycle moves on.
    pub fn should_skip(&self, now: Instant) -> bool {
        matches!(self.next_allowed, Some(at) if now < at)
    }

    pub fn on_success(&mut self, now: Instant) {
        self.backoff = Duration::ZERO;
        self.next_allowed = Some(match self.interval {
            Some(interval) => now + interval,
            None => now,
        });
    }

    pub fn on_error(&mut self, now: Instant) {
        self.backoff = if self.backoff.is_zero() {
            INITIAL_BACKOFF
        } else {
            (self.backoff * 2).min(MAX_BACKOFF)
        };
        self.next_allowed = Some(now + self.backoff);
    }

    /// Current backoff; zero after a success.
    pub fn backoff(&self) -> Duration {
        self.backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_throttle_never_skips() {
        let throttle = Throttle::new(Some(Duration::from_secs(30)));
        assert!(!throttle.should_skip(Instant::now()));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut throttle = Throttle::new(None);
        let now = Instant::now();

        throttle.on_error(now);
        assert_eq!(throttle.backoff(), Duration::from_secs(1));
        assert!(throttle.should_skip(now + Duration::from_millis(500)));
        assert!(!throttle.should_skip(now + Duration::from_secs(1)));

        throttle.on_error(now);
        assert_eq!(throttle.backoff(), Duration::from_secs(2));
        throttle.on_error(now);
        assert_eq!(throttle.backoff(), Duration::from_secs(4));

        for _ in 0..10 {
            throttle.on_error(now);
        }
        assert_eq!(throttle.backoff(), Duration::from_secs(60));
        assert!(throttle.should_skip(now + Duration::from_secs(59)));
        assert!(!throttle.should_skip(now + Duration::from_secs(60)));
    }

    #[test]
    fn success_resets_backoff_and_reschedules() {
        let mut throttle = Throttle::new(Some(Duration::from_secs(30)));
        let now = Instant::now();

        throttle.on_error(now);
        throttle.on_error(now);
        assert_eq!(throttle.backoff(), Duration::from_secs(2));

        throttle.on_success(now);
        assert_eq!(throttle.backoff(), Duration::ZERO);
        assert!(throttle.should_skip(now + Duration::from_secs(29)));
        assert!(!throttle.should_skip(now + Duration::from_secs(30)));

        // The next failure starts over at one second.
        throttle.on_error(now + Duration::from_secs(30));
        assert_eq!(throttle.backoff(), Duration::from_secs(1));
    }

    #[test]
    fn success_without_interval_stays_eligible() {
        let mut throttle = Throttle::new(None);
        let now = Instant::now();
        throttle.on_success(now);
        assert!(!throttle.should_skip(now));
        assert!(!throttle.should_skip(now + Duration::from_millis(1)));
    }
}
