//! Backoff schedule for lock acquisition retries.
//!
//! The schedule is a pure function of the attempt number: exponential growth
//! from `min_timeout` by `factor`, capped at `max_timeout`, optionally scaled by
//! a random factor in `[1, 2)` so contending processes spread out.

use crate::config::CacheDefaults;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

/// Retry policy for a contended lock.
///
/// Timeouts are in milliseconds to match the descriptor surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Number of retries after the first attempt (0 disables waiting).
    pub retries: u32,
    /// Exponential base.
    pub factor: f64,
    /// Delay before the first retry (ms).
    pub min_timeout: u64,
    /// Delay cap (ms).
    pub max_timeout: u64,
    /// Scale each delay by a random factor in `[1, 2)`.
    pub randomize: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: CacheDefaults::RETRIES,
            factor: CacheDefaults::RETRY_FACTOR,
            min_timeout: CacheDefaults::RETRY_MIN_TIMEOUT.as_millis() as u64,
            max_timeout: CacheDefaults::RETRY_MAX_TIMEOUT.as_millis() as u64,
            randomize: false,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given number of retries and default timing.
    pub fn new(retries: u32) -> Self {
        Self {
            retries,
            ..Self::default()
        }
    }

    /// Set the exponential base.
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Set the first and maximum delays.
    pub fn with_timeouts(mut self, min: Duration, max: Duration) -> Self {
        self.min_timeout = min.as_millis() as u64;
        self.max_timeout = max.as_millis() as u64;
        self
    }

    /// Enable or disable randomized delays.
    pub fn with_randomize(mut self, randomize: bool) -> Self {
        self.randomize = randomize;
        self
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let random = if self.randomize {
            rand::rng().random_range(1.0..2.0)
        } else {
            1.0
        };
        self.delay_with(attempt, random)
    }

    fn delay_with(&self, attempt: u32, random: f64) -> Duration {
        // min_timeout * factor^attempt, never below 1ms so factor growth still applies
        let base = self.min_timeout.max(1) as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = (random * base * self.factor.powi(exponent)).round();
        let capped = millis.min(self.max_timeout as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Accepts either a retry count or a full policy object.
pub(crate) fn count_or_policy<'de, D>(deserializer: D) -> Result<RetryPolicy, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Count(u32),
        Policy(RetryPolicy),
    }

    Ok(match Repr::deserialize(deserializer)? {
        Repr::Count(retries) => RetryPolicy::new(retries),
        Repr::Policy(policy) => policy,
    })
}
