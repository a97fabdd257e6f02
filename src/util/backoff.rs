//! Backoff for retrying worker launches.

use std::thread;
use std::time::Duration;

/// Doubling sleep between attempts, capped, reset after a success.
#[derive(Debug)]
pub struct Backoff {
    step: u32,
    base: Duration,
    max: Duration,
}

impl Backoff {
    const MAX_STEP: u32 = 16;

    pub fn new(base: Duration, max: Duration) -> Self {
        Self { step: 0, base, max }
    }

    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Delay the next `snooze` will sleep for.
    pub fn next_delay(&self) -> Duration {
        self.base
            .saturating_mul(1u32 << self.step.min(Self::MAX_STEP))
            .min(self.max)
    }

    pub fn snooze(&mut self) {
        thread::sleep(self.next_delay());
        self.step = self.step.saturating_add(1);
    }

    pub fn attempts(&self) -> u32 {
        self.step
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(10), Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(4));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1));
        backoff.snooze();
        assert_eq!(backoff.next_delay(), Duration::from_millis(2));
        backoff.snooze();
        backoff.snooze();
        assert_eq!(backoff.next_delay(), Duration::from_millis(4));
        assert_eq!(backoff.attempts(), 3);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(8));
        backoff.snooze();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(1));
    }
}
