//! Retry policy: attempt limits and exponential backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default attempts before a retryable failure becomes permanent.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Exponential backoff bounded by a cap.
///
/// `delay(attempts) = min(base * 2^(attempts - 1), cap)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt
    pub base: Duration,
    /// Upper bound for any single delay
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(15 * 60),
            cap: Duration::from_secs(240 * 60),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before the next attempt, given the number of attempts made so far (1-indexed).
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }

        let exp = attempts - 1;
        if exp >= u32::BITS {
            return self.cap;
        }

        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

/// Attempt limit + backoff, as applied by the store when recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Used when neither the caller nor the handler supplies a limit
    pub default_max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    /// Decide what happens after a failed attempt.
    ///
    /// `attempts` is the count *including* the attempt that just failed.
    /// An explicit `retry_delay` replaces the computed backoff.
    pub fn after_failure(
        &self,
        attempts: u32,
        max_attempts: Option<u32>,
        retry_delay: Option<Duration>,
    ) -> RetryDecision {
        let max = max_attempts.unwrap_or(self.default_max_attempts);
        if attempts >= max {
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryAfter(
                retry_delay.unwrap_or_else(|| self.backoff.delay_for_attempt(attempts)),
            )
        }
    }
}

/// Outcome of [`RetryPolicy::after_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return to `pending`, not claimable before the delay elapses
    RetryAfter(Duration),
    /// Attempts exhausted, move to `permanently_failed`
    GiveUp,
}
