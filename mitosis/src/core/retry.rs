//! Retry policy: decides whether a failed step gets another attempt.
//!
//! Pure and side-effect free so it can be tested without a store or server.

use crate::task::MAX_STEP_RETRIES;

/// Verdict for a step that just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
}

/// `retry_count` is the number of failed attempts recorded so far, including
/// the one being decided on.
pub fn decide(retry_count: u32, max_retries: u32) -> RetryDecision {
    RetryDecision {
        retry: retry_count < max_retries,
    }
}

/// Retry policy with a fixed cap on failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        decide(retry_count, self.max_retries)
    }

    pub fn remaining(&self, retry_count: u32) -> u32 {
        self.max_retries.saturating_sub(retry_count)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(MAX_STEP_RETRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_until_count_reaches_max() {
        for count in 0..MAX_STEP_RETRIES {
            assert!(decide(count, MAX_STEP_RETRIES).retry, "count {count}");
        }
        assert!(!decide(MAX_STEP_RETRIES, MAX_STEP_RETRIES).retry);
        assert!(!decide(MAX_STEP_RETRIES + 1, MAX_STEP_RETRIES).retry);
    }

    #[test]
    fn zero_cap_never_retries() {
        assert!(!decide(0, 0).retry);
    }

    #[test]
    fn remaining_saturates_at_zero() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.remaining(2), 3);
        assert_eq!(policy.remaining(9), 0);
    }
}
