//! Retry policy: decides whether a failed message is retried, and after what delay.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::Rng;

use crate::config::RetryOptions;

/// Injected into the worker pool.
pub trait RetryPolicy: Send + Sync {
    /// `current_count` is how many times `exception_type` has already been
    /// recorded for the message, before this failure.
    fn should_retry(&self, exception_type: &str, current_count: u32) -> bool;

    /// Delay before retry number `retry` (1-indexed).
    fn next_delay(&self, retry: u32) -> Duration;
}

/// Exponential backoff with optional jitter and per-exception-type limits.
#[derive(Debug, Clone)]
pub struct ExponentialRetryPolicy {
    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    pub max_retries: u32,

    /// Fraction of the computed delay randomly added or removed.
    pub jitter: f64,

    pub per_exception: BTreeMap<String, u32>,
}

impl Default for ExponentialRetryPolicy {
    fn default() -> Self {
        Self::from_options(&RetryOptions::default())
    }
}

impl ExponentialRetryPolicy {
    pub fn from_options(options: &RetryOptions) -> Self {
        Self {
            base_delay: Duration::from_millis(options.base_delay_ms),
            multiplier: options.multiplier,
            max_retries: options.max_retries,
            jitter: options.jitter,
            per_exception: options.per_exception.clone(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_limit(mut self, exception_type: impl Into<String>, max_retries: u32) -> Self {
        self.per_exception.insert(exception_type.into(), max_retries);
        self
    }

    pub fn max_retries_for(&self, exception_type: &str) -> u32 {
        self.per_exception
            .get(exception_type)
            .copied()
            .unwrap_or(self.max_retries)
    }

    /// delay = base_delay * multiplier^(retry - 1), without jitter.
    ///
    /// With base_delay=2s, multiplier=2.0:
    /// - retry 1: 2s
    /// - retry 2: 4s
    /// - retry 3: 8s
    pub fn base_delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

impl RetryPolicy for ExponentialRetryPolicy {
    fn should_retry(&self, exception_type: &str, current_count: u32) -> bool {
        current_count < self.max_retries_for(exception_type)
    }

    fn next_delay(&self, retry: u32) -> Duration {
        let delay = self.base_delay_for(retry);
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(delay)
    }
}
