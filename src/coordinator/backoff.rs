// src/coordinator/backoff.rs
use crate::config::CoordinatorConfig;
use std::time::Duration;

/// Exponential reconnection delay: `initial`, then ×`multiplier` per failure up to `cap`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    multiplier: u32,
    cap: Duration,
    current: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(initial: Duration, multiplier: u32, cap: Duration) -> Self {
        Self { initial, multiplier, cap, current: initial.min(cap), failures: 0 }
    }

    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_initial_ms),
            config.backoff_multiplier,
            Duration::from_millis(config.backoff_cap_ms),
        )
    }

    /// Records a failure and returns how long to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.failures += 1;
        self.current = self.current.saturating_mul(self.multiplier).min(self.cap);
        delay
    }

    /// Called after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.initial.min(self.cap);
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_doubles_to_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), 2, Duration::from_secs(60));
        let delays: Vec<u64> = (0..9).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60, 60]);
        assert_eq!(backoff.failures(), 9);
    }

    #[test]
    fn test_reset_after_success() {
        let mut backoff = Backoff::new(Duration::from_secs(1), 2, Duration::from_secs(60));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}
