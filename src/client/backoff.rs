//! Reconnection delays.

use std::time::Duration;

/// Exponential backoff: `delay(n) = min(base * 2^(n-1), cap)` for attempts
/// `1..=max_attempts`, after which the client gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    /// 1s, 2s, 4s, ... capped at 32s, for ten attempts.
    fn default() -> Self {
        Backoff {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(32),
            max_attempts: 10,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Backoff {
            base,
            cap,
            max_attempts,
        }
    }

    /// Delay before reconnection attempt `attempt` (1-based), or `None` once
    /// the attempts are exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.max_attempts {
            return None;
        }
        let exponent = attempt.saturating_sub(1);
        let delay = 2u32
            .checked_pow(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(self.cap);
        Some(delay.min(self.cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_until_cap() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500), 5);
        let delays: Vec<_> = (1..=5).map(|n| backoff.delay(n).unwrap()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500),
                Duration::from_millis(500),
            ]
        );
        assert_eq!(backoff.delay(6), None);
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), u32::MAX);
        assert_eq!(backoff.delay(200), Some(Duration::from_secs(30)));
    }
}
