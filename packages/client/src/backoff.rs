//! Reconnect delay policy.
//!
//! The delay starts at zero (an immediate first retry), then doubles per
//! attempt from the configured initial value up to the cap. Any
//! successful response from the service resets it to zero.

use std::time::Duration;

/// Exponential reconnect backoff with a zero-delay first attempt.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Creates a policy doubling from `initial` up to `max`.
    #[must_use]
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: Duration::ZERO,
        }
    }

    /// Returns the delay for the next attempt and advances the policy.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = if self.current.is_zero() {
            self.initial
        } else {
            self.current.saturating_mul(2).min(self.max)
        };
        delay
    }

    /// Resets the delay to zero after a successful response.
    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> Backoff {
        Backoff::new(Duration::from_millis(100), Duration::from_secs(1))
    }

    #[test]
    fn first_attempt_is_immediate_then_doubles() {
        let mut backoff = policy();
        assert_eq!(backoff.next(), Duration::ZERO);
        assert_eq!(backoff.next(), Duration::from_millis(100));
        assert_eq!(backoff.next(), Duration::from_millis(200));
        assert_eq!(backoff.next(), Duration::from_millis(400));
    }

    #[test]
    fn delay_caps_at_max() {
        let mut backoff = policy();
        for _ in 0..16 {
            let _ = backoff.next();
        }
        assert_eq!(backoff.next(), Duration::from_secs(1));
        assert_eq!(backoff.next(), Duration::from_secs(1));
    }

    #[test]
    fn reset_returns_to_immediate() {
        let mut backoff = policy();
        let _ = backoff.next();
        let _ = backoff.next();
        backoff.reset();
        assert_eq!(backoff.next(), Duration::ZERO);
        assert_eq!(backoff.next(), Duration::from_millis(100));
    }
}
