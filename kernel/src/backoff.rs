// Exponential Backoff
//
// Capped, optionally jittered delays for agreement polling and fetch
// retries.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::{AgreementConfig, RetryConfig};

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: bool,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: bool) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: multiplier.max(1.0),
            jitter,
            attempt: 0,
        }
    }

    pub fn for_agreement(config: &AgreementConfig) -> Self {
        Self::new(config.interval(), config.max_interval(), 2.0, true)
    }

    pub fn for_retry(config: &RetryConfig) -> Self {
        Self::new(
            config.initial_delay(),
            config.max_delay(),
            config.multiplier,
            config.jitter,
        )
    }

    /// Delay before the next attempt. Never exceeds the cap.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        let delay = self.delay_for_attempt(self.attempt);

        if self.jitter {
            // Shave up to 25% off so concurrent pollers spread out.
            let factor = 1.0 - rand::random::<f64>() * 0.25;
            delay.mul_f64(factor)
        } else {
            delay
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let nanos = self.initial.as_nanos() as f64 * self.multiplier.powi(exponent);
        if nanos >= self.max.as_nanos() as f64 {
            self.max
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }
}

/// `start + within`, clamped to roughly thirty years out for durations
/// too large to add.
pub(crate) fn deadline_after(start: Instant, within: Duration) -> Instant {
    start
        .checked_add(within)
        .unwrap_or_else(|| start + Duration::from_secs(86_400 * 365 * 30))
}
