//! Retry policy: decides backoff delays.

use std::time::Duration;

/// What to do with a job whose turn just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back off for this long, then retry.
    Delay(Duration),
    /// Attempts are exhausted.
    GiveUp,
}

/// Exponential backoff: `min(base_delay * multiplier^attempts, max_delay)`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            multiplier: 2,
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl RetryPolicy {
    /// Use a per-job base delay instead of the policy's, when one is set.
    pub fn with_base_override(&self, base_ms: u64) -> Self {
        let mut policy = self.clone();
        if base_ms > 0 {
            policy.base_delay = Duration::from_millis(base_ms);
        }
        policy
    }

    /// Backoff once `attempts` attempts have been consumed.
    ///
    /// With the default policy: 1 -> 2s, 2 -> 4s, 3 -> 8s, ... capped at 30s.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = self.multiplier.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decide the fate of a job that has used `attempts` attempts before
    /// this failure and may use at most `max_attempts`.
    pub fn decide(&self, attempts: u32, max_attempts: u32) -> RetryDecision {
        let consumed = attempts.saturating_add(1);
        if consumed < max_attempts {
            RetryDecision::Delay(self.backoff(consumed))
        } else {
            RetryDecision::GiveUp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backoff_sequence() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff(2), Duration::from_millis(4000));
        assert_eq!(policy.backoff(4), Duration::from_millis(16_000));
        assert_eq!(policy.backoff(5), Duration::from_millis(30_000));
        assert_eq!(policy.backoff(60), Duration::from_millis(30_000));
    }

    #[test]
    fn three_attempts_retry_twice_then_give_up() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(0, 3),
            RetryDecision::Delay(Duration::from_millis(2000))
        );
        assert_eq!(
            policy.decide(1, 3),
            RetryDecision::Delay(Duration::from_millis(4000))
        );
        assert_eq!(policy.decide(2, 3), RetryDecision::GiveUp);
    }

    #[test]
    fn single_attempt_never_retries() {
        assert_eq!(RetryPolicy::default().decide(0, 1), RetryDecision::GiveUp);
    }

    #[test]
    fn base_override() {
        let policy = RetryPolicy::default().with_base_override(100);
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        let unchanged = RetryPolicy::default().with_base_override(0);
        assert_eq!(unchanged.base_delay, Duration::from_millis(1000));
    }
}
