//! Exponential backoff for reconnection

use std::time::Duration;

use rde_core::config::BackoffConfig;

/// Exponential backoff with jitter for reconnection attempts
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// First delay, restored by `reset`
    initial: Duration,
    /// Delay returned by the next call
    current: Duration,
    /// Maximum delay
    max: Duration,
    multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    jitter: f64,
}

impl ExponentialBackoff {
    /// Create a new backoff from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier, config.jitter)
    }

    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            initial,
            current: initial.min(max),
            max,
            multiplier: multiplier.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Get the next delay and advance the backoff
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = next.min(self.max);
        self.jittered(delay)
    }

    /// The capped delay, used after the broker rejected our credentials
    pub fn max_delay(&self) -> Duration {
        self.jittered(self.max)
    }

    /// Start over from the initial delay
    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }

    /// Spread `delay` by up to `jitter` either way
    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter == 0.0 {
            return delay;
        }
        let factor = 1.0 + self.jitter * (2.0 * rand::random::<f64>() - 1.0);
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_increases() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(300),
            2.0,
            0.0, // No jitter for deterministic test
        );

        let delays: Vec<_> = (0..4).map(|_| backoff.next_delay()).collect();
        assert_eq!(delays, [1, 2, 4, 8].map(Duration::from_secs).to_vec());
    }

    #[test]
    fn test_backoff_max_and_reset() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(200), Duration::from_secs(300), 2.0, 0.0);

        assert_eq!(backoff.next_delay(), Duration::from_secs(200));
        assert_eq!(backoff.next_delay(), Duration::from_secs(300));
        assert_eq!(backoff.next_delay(), Duration::from_secs(300));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(200));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(100), 2.0, 0.25);
        for _ in 0..100 {
            let delay = backoff.max_delay();
            assert!(delay >= Duration::from_secs(75) && delay <= Duration::from_secs(125));
        }
    }
}
