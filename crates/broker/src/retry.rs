//! Retry policies for broker delivery.

use std::time::Duration;

/// Default number of delivery attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay between delivery attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// How many times to attempt a delivery and how long to wait in between.
///
/// Attempts are counted from 1, and `max_attempts` includes the first try.
/// A `max_attempts` of zero is treated as one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryPolicy {
    /// A single attempt, no retries.
    None,

    /// The same delay after every failed attempt.
    Fixed { max_attempts: u32, delay: Duration },

    /// `initial * multiplier^(attempt - 1)` after each failed attempt,
    /// capped at `max_delay`.
    Exponential {
        max_attempts: u32,
        initial: Duration,
        multiplier: u32,
        max_delay: Duration,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Fixed {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Creates a fixed-delay policy.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        RetryPolicy::Fixed {
            max_attempts,
            delay,
        }
    }

    /// Creates an exponential policy that doubles the delay each time.
    pub fn exponential(max_attempts: u32, initial: Duration, max_delay: Duration) -> Self {
        RetryPolicy::Exponential {
            max_attempts,
            initial,
            multiplier: 2,
            max_delay,
        }
    }

    /// Total number of attempts allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        match self {
            RetryPolicy::None => 1,
            RetryPolicy::Fixed { max_attempts, .. }
            | RetryPolicy::Exponential { max_attempts, .. } => (*max_attempts).max(1),
        }
    }

    /// Delay to wait after `attempt` (1-based) failed, before the next one.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self {
            RetryPolicy::None => Duration::ZERO,
            RetryPolicy::Fixed { delay, .. } => *delay,
            RetryPolicy::Exponential {
                initial,
                multiplier,
                max_delay,
                ..
            } => {
                let factor = multiplier.saturating_pow(attempt.saturating_sub(1));
                initial.saturating_mul(factor).min(*max_delay)
            }
        }
    }

    /// Returns the policy name used in configuration and logs.
    pub fn name(&self) -> &'static str {
        match self {
            RetryPolicy::None => "none",
            RetryPolicy::Fixed { .. } => "fixed",
            RetryPolicy::Exponential { .. } => "exponential",
        }
    }
}
