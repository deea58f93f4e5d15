//! Wait tuning.

use std::time::Duration;

use rand::Rng;

use crate::{DEFAULT_POLL_INTERVAL, DEFAULT_WAIT_TIMEOUT};

/// How a single wait polls and when it gives up.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitOptions {
    /// Spacing between the end of one poll and the start of the next.
    pub interval: Duration,

    /// Ceiling on the whole wait, measured from the call to `wait_for`.
    pub timeout: Duration,

    /// Optional ceiling on the number of polls.
    pub max_attempts: Option<u32>,

    /// Pause before the first poll.
    pub initial_delay: Duration,

    /// Extra random delay per poll, as a fraction of `interval` (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_WAIT_TIMEOUT,
            max_attempts: None,
            initial_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }
}

impl WaitOptions {
    /// Options with the given timeout and default spacing.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Delay before the next poll, including jitter.
    pub fn next_delay(&self) -> Duration {
        if self.jitter <= 0.0 || self.interval.is_zero() {
            return self.interval;
        }

        let max_extra = self.interval.as_secs_f64() * self.jitter.min(1.0);
        let extra = rand::rng().random_range(0.0..=max_extra);
        self.interval
            .saturating_add(Duration::try_from_secs_f64(extra).unwrap_or(Duration::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = WaitOptions::default();
        assert_eq!(options.interval, Duration::from_secs(3));
        assert_eq!(options.timeout, Duration::from_secs(120));
        assert_eq!(options.max_attempts, None);
        assert_eq!(options.next_delay(), Duration::from_secs(3));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let options = WaitOptions::default()
            .interval(Duration::from_millis(100))
            .jitter(0.5);

        for _ in 0..100 {
            let delay = options.next_delay();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_jitter_is_clamped() {
        let options = WaitOptions::default().jitter(7.0);
        assert_eq!(options.jitter, 1.0);

        let options = WaitOptions::default().jitter(-1.0);
        assert_eq!(options.jitter, 0.0);
    }

    #[test]
    fn test_non_finite_jitter_is_disabled() {
        for jitter in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let options = WaitOptions::default().jitter(jitter);
            assert_eq!(options.jitter, 0.0);
            assert_eq!(options.next_delay(), Duration::from_secs(3));
        }
    }

    #[test]
    fn test_huge_interval_with_jitter_saturates() {
        let options = WaitOptions::default().interval(Duration::MAX).jitter(1.0);
        assert_eq!(options.next_delay(), Duration::MAX);
    }

    #[test]
    fn test_max_attempts_at_least_one() {
        let options = WaitOptions::default().max_attempts(0);
        assert_eq!(options.max_attempts, Some(1));
    }
}
