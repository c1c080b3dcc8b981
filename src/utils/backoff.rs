// src/utils/backoff.rs
//! Exponential backoff for transient retries
//!
//! The delay doubles (by `multiplier`) after each attempt, capped at
//! `max_delay`, with up to `jitter` of random spread added so retries from
//! concurrent tasks do not line up.

use rand::Rng;
use std::time::Duration;

/// Backoff calculator
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: u32,
    jitter: Duration,
    current_delay: Duration,

    /// Number of attempts taken so far
    pub attempt: u32,
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: u32) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: multiplier.max(1),
            jitter: Duration::ZERO,
            current_delay: initial_delay,
            attempt: 0,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Returns the current delay and advances the state
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        self.attempt += 1;
        self.current_delay = (self.current_delay * self.multiplier).min(self.max_delay);

        if self.jitter.is_zero() {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        (delay + Duration::from_millis(spread)).min(self.max_delay.max(delay))
    }

    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    pub fn exceeded_max_attempts(&self, max: u32) -> bool {
        self.attempt >= max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_with_cap() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(500), 2);
        assert_eq!(b.next_delay(), Duration::from_millis(100));
        assert_eq!(b.next_delay(), Duration::from_millis(200));
        assert_eq!(b.next_delay(), Duration::from_millis(400));
        assert_eq!(b.next_delay(), Duration::from_millis(500));
        assert_eq!(b.attempt, 4);
    }

    #[test]
    fn test_jitter_stays_bounded() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 2)
            .with_jitter(Duration::from_millis(50));
        for _ in 0..20 {
            b.reset();
            let delay = b.next_delay();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_exceeded_max_attempts() {
        let mut b = Backoff::new(Duration::from_millis(1), Duration::from_millis(10), 2);
        assert!(!b.exceeded_max_attempts(1));
        b.next_delay();
        assert!(b.exceeded_max_attempts(1));
        b.reset();
        assert_eq!(b.attempt, 0);
    }
}
