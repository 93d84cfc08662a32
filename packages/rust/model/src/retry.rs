//! Exponential backoff for transient model failures.

use std::time::Duration;

use rand::Rng;

/// Check if an HTTP status code represents a transient/retryable error.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504 | 529)
}

/// Attempt budget and backoff curve.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Production policy: 4s doubling, capped at 60s.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(60),
        }
    }

    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based). A server `Retry-After`
    /// raises the floor but is capped at 60s.
    pub fn delay_for(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        if self.max_delay.is_zero() {
            return Duration::ZERO;
        }
        let base_ms = self.base_delay.as_millis() as u64;
        let capped_ms = base_ms
            .saturating_mul(2u64.saturating_pow(attempt.min(16)))
            .min(self.max_delay.as_millis() as u64);
        let delay_ms = match retry_after_secs {
            Some(secs) => (secs.min(60) * 1000).max(capped_ms),
            None => capped_ms,
        };
        Duration::from_millis(apply_jitter(delay_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// ±25% jitter.
fn apply_jitter(base_ms: u64) -> u64 {
    let range = base_ms / 4;
    if range == 0 {
        return base_ms;
    }
    let offset = rand::thread_rng().gen_range(0..=2 * range);
    base_ms - range + offset
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(529));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
    }

    #[test]
    fn backoff_doubles_within_jitter_and_caps() {
        let policy = RetryPolicy::new(3);
        let first = policy.delay_for(0, None).as_millis();
        assert!((3000..=5000).contains(&first));
        let second = policy.delay_for(1, None).as_millis();
        assert!((6000..=10000).contains(&second));
        let huge = policy.delay_for(10, None).as_millis();
        assert!(huge <= 75_000);
    }

    #[test]
    fn retry_after_raises_floor() {
        let policy = RetryPolicy::new(3);
        let delay = policy.delay_for(0, Some(30)).as_millis();
        assert!(delay >= 22_500);
    }

    #[test]
    fn immediate_policy_never_sleeps() {
        let policy = RetryPolicy::immediate(3);
        assert_eq!(policy.delay_for(2, Some(10)), Duration::ZERO);
    }
}
