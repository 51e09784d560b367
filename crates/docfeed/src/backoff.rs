//! Exponential backoff for workers whose connection keeps failing.

use std::time::Duration;

/// Backoff settings.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First sleep after a failure (default: 100ms).
    pub initial: Duration,
    /// Upper bound on any sleep (default: 3 seconds).
    pub max: Duration,
    /// Growth factor between consecutive failures (default: 2.0).
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(3),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Default growth, capped at `max`.
    pub fn with_max(max: Duration) -> Self {
        Self {
            initial: Self::default().initial.min(max),
            max,
            ..Self::default()
        }
    }
}

/// Tracks consecutive connection failures of one worker.
///
/// Delays are `initial * multiplier^failures`, capped at `max`, and never decrease until
/// [`reset`](Self::reset) is called after a successful send. No jitter is added.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    failures: u32,
}

impl Backoff {
    /// Creates a backoff with no recorded failures.
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Records a failure and returns how long to sleep before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.compute(self.failures);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Forgets past failures.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    fn compute(&self, attempt: u32) -> Duration {
        let base_ms = self.config.initial.as_millis() as f64;
        let max_ms = self.config.max.as_millis() as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let computed = base_ms * self.config.multiplier.max(1.0).powi(exponent);
        Duration::from_millis(computed.min(max_ms) as u64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_config_default() {
        let config = BackoffConfig::default();
        assert_eq!(config.initial, Duration::from_millis(100));
        assert_eq!(config.max, Duration::from_secs(3));
        assert_eq!(config.multiplier, 2.0);
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
            multiplier: 2.0,
        });
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.failures(), 5);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_with_max_below_initial() {
        let mut backoff = Backoff::new(BackoffConfig::with_max(Duration::from_millis(20)));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
    }

    #[test]
    fn test_huge_attempt_count_saturates() {
        let mut backoff = Backoff::default();
        for _ in 0..10_000 {
            assert!(backoff.next_delay() <= Duration::from_secs(3));
        }
    }
}
