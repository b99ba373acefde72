//! Reconnect limits and the delays between attempts.
//!
//! Shards and voice connections each keep their own [`RetryState`], so one
//! flapping connection never consumes another's budget.

mod strategy;

pub use self::strategy::*;

use std::time::Duration;

/// How many reconnects to attempt, and how long to wait before each.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Retry {
    /// Strategy used to determine how long to wait between retry attempts.
    ///
    /// *Defaults to an [`ExponentialBackoff`] from 0.25s
    /// to 10s, with a jitter of `0.1`.*
    ///
    /// [`ExponentialBackoff`]: Strategy::Backoff
    pub strategy: Strategy,
    /// The maximum number of consecutive retries to attempt.
    ///
    /// `None` retries forever, while `Some(0)` gives up after the first failure.
    ///
    /// *Defaults to `Some(10)`.*
    pub retry_limit: Option<usize>,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            strategy: Strategy::Backoff(ExponentialBackoff::default()),
            retry_limit: Some(10),
        }
    }
}

impl Retry {
    /// Creates a default strategy with the given attempt limit.
    #[must_use]
    pub fn with_limit(retry_limit: Option<usize>) -> Self {
        Self {
            retry_limit,
            ..Default::default()
        }
    }
}

/// Consecutive failure count for one connection.
#[derive(Clone, Debug, Default)]
pub struct RetryState {
    attempts: usize,
}

impl RetryState {
    /// Records a failure and returns how long to wait before the next attempt.
    ///
    /// Returns `None` once `policy.retry_limit` consecutive retries have failed.
    pub fn next_delay(&mut self, policy: &Retry) -> Option<Duration> {
        if policy.retry_limit.is_some_and(|limit| self.attempts >= limit) {
            return None;
        }

        self.attempts += 1;
        Some(policy.strategy.delay(self.attempts))
    }

    /// Number of retries since the last success.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Clears the failure count after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
