use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Exponential backoff applied to transient network failures. Uploader and
/// Fetcher share the policy type; each call keeps its own attempt counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay to wait after the given failed attempt (1-based) before the next one.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }

    /// Sum of every backoff sleep when all attempts fail.
    pub fn total_backoff(&self) -> Duration {
        (1..self.max_attempts.max(1))
            .map(|attempt| self.delay_after(attempt))
            .sum()
    }

    /// Upper bound for one retried call when each attempt may take up to
    /// `per_attempt` before timing out.
    pub fn worst_case(&self, per_attempt: Duration) -> Duration {
        per_attempt
            .checked_mul(self.max_attempts.max(1))
            .unwrap_or(Duration::MAX)
            .saturating_add(self.total_backoff())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_from_one_second_and_cap_at_thirty() {
        let policy = RetryPolicy::default().with_attempts(8);
        let delays: Vec<u64> = (1..8).map(|a| policy.delay_after(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn huge_attempt_numbers_saturate_at_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(500), DEFAULT_MAX_DELAY);
    }

    #[test]
    fn retry_bound_counts_total_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[test]
    fn worst_case_adds_timeouts_and_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.total_backoff(), Duration::from_secs(3));
        assert_eq!(
            policy.worst_case(Duration::from_secs(3)),
            Duration::from_secs(12)
        );
    }
}
