//! Exponential backoff for cycle retries and tunnel reconnects.

use std::time::Duration;

/// Exponential backoff with optional jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    current: Duration,
    max: Duration,
    multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    jitter: f64,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            initial,
            current: initial,
            max,
            multiplier,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Watch cycle retries: 500ms doubling up to 30s, no jitter.
    pub fn for_cycle_retry() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30), 2.0, 0.0)
    }

    /// Tunnel stream reconnects.
    pub fn for_reconnect() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30), 2.0, 0.1)
    }

    /// Get the next delay and advance the backoff.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = std::cmp::min(next, self.max);

        if self.jitter == 0.0 {
            return delay;
        }
        let jitter_amount = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
        delay + Duration::from_secs_f64(jitter_amount)
    }

    /// Delay the next call to [`Self::next_delay`] would return, without jitter.
    pub fn peek(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
