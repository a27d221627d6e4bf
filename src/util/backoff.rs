//! Exponential retry delay for transport failures

use std::time::Duration;

/// Doubling backoff with a ceiling
#[derive(Debug, Clone)]
pub struct Backoff {
    max: Duration,
    current: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            max,
            current: initial,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before retrying
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.failures = self.failures.saturating_add(1);
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Failures so far
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// True only for the first failure of a streak (report-once logging)
    pub fn is_first_failure(&self) -> bool {
        self.failures == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_ceiling() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.failures(), 5);
    }

    #[test]
    fn test_first_failure_reported_once() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        assert!(!backoff.is_first_failure());
        backoff.next_delay();
        assert!(backoff.is_first_failure());
        backoff.next_delay();
        assert!(!backoff.is_first_failure());
    }
}
