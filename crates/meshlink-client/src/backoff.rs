//! Retry scheduling with exponential backoff

use std::time::Duration;
use tracing::debug;

/// Backoff configuration for connect and login retries
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
    /// Growth factor applied after each retry
    pub multiplier: f64,
    /// Maximum number of retries (None = unlimited)
    pub max_attempts: Option<usize>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: Some(5),
        }
    }
}

/// Retry schedule.
///
/// The control loop owns the timer; `Backoff` only hands out delays so a
/// pending retry can be cancelled by simply forgetting the deadline.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Delay before the next retry, or `None` once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return None;
            }
        }

        let delay = self.current_backoff;
        debug!(
            "Retry {} scheduled in {}ms",
            self.attempt,
            delay.as_millis()
        );

        // Saturates at max_backoff when the product is not representable
        let next_backoff = Duration::try_from_secs_f64(
            self.current_backoff.as_secs_f64() * self.config.multiplier,
        )
        .unwrap_or(self.config.max_backoff);
        self.current_backoff = next_backoff.min(self.config.max_backoff);

        Some(delay)
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_attempts: Option<usize>) -> BackoffConfig {
        BackoffConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_attempts,
        }
    }

    #[test]
    fn test_delays_grow_and_cap() {
        let mut backoff = Backoff::new(config(None));

        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(20)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(40)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(80)));
        // Should cap at max_backoff
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.attempt(), 6);
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(config(None));

        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();

        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.current_backoff(), Duration::from_millis(10));
    }

    #[test]
    fn test_max_attempts() {
        let mut backoff = Backoff::new(config(Some(3)));

        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
    }

    #[test]
    fn test_unrepresentable_growth_saturates() {
        let mut backoff = Backoff::new(BackoffConfig {
            multiplier: f64::INFINITY,
            ..config(None)
        });
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));

        let mut backoff = Backoff::new(BackoffConfig {
            multiplier: f64::NAN,
            ..config(None)
        });
        backoff.next_delay();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_unbounded_schedule_never_overflows() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::MAX,
            multiplier: 2.0,
            max_attempts: None,
        });

        for _ in 0..200 {
            assert!(backoff.next_delay().is_some());
        }
        assert_eq!(backoff.current_backoff(), Duration::MAX);
    }

    #[test]
    fn test_default_schedule() {
        let defaults = BackoffConfig::default();
        assert_eq!(defaults.initial_backoff, Duration::from_secs(1));
        assert_eq!(defaults.max_backoff, Duration::from_secs(30));
        assert_eq!(defaults.max_attempts, Some(5));
    }
}
