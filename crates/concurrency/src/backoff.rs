//! Bounded backoff for waiting on live locks and flaky services

use std::thread;

use seep_core::RetryPolicy;

/// Action to take after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffAction {
    /// The delay was served; try again
    Retry,
    /// The retry budget is spent
    Abort,
}

/// Exponential backoff driven by a [`RetryPolicy`]
///
/// `max_attempts` counts every try, the first included, so a policy with
/// `max_attempts = 1` never retries.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    /// Fresh backoff for one operation
    pub fn new(policy: RetryPolicy) -> Self {
        Backoff { policy, attempt: 0 }
    }

    /// Tries made so far, counting the first
    pub fn attempts(&self) -> u32 {
        self.attempt + 1
    }

    /// Wait before the next try
    ///
    /// Sleeps for the policy's delay (yielding instead when the delay is
    /// zero) and returns `Retry`, or returns `Abort` without sleeping once
    /// the budget is spent.
    pub fn wait(&mut self) -> BackoffAction {
        if self.attempt + 1 >= self.policy.max_attempts {
            return BackoffAction::Abort;
        }
        let delay = self.policy.delay(self.attempt);
        self.attempt += 1;
        if delay.is_zero() {
            thread::yield_now();
        } else {
            thread::sleep(delay);
        }
        BackoffAction::Retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    #[test]
    fn test_single_attempt_never_retries() {
        let mut backoff = Backoff::new(policy(1));
        assert_eq!(backoff.wait(), BackoffAction::Abort);
        assert_eq!(backoff.attempts(), 1);
    }

    #[test]
    fn test_budget_counts_first_attempt() {
        let mut backoff = Backoff::new(policy(3));
        assert_eq!(backoff.wait(), BackoffAction::Retry);
        assert_eq!(backoff.wait(), BackoffAction::Retry);
        assert_eq!(backoff.wait(), BackoffAction::Abort);
        assert_eq!(backoff.attempts(), 3);
    }
}
