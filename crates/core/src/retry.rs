//! Retry advice attached to classified errors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ClassifiedError;

/// How the delay grows between consecutive retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time.
    Fixed,
    /// `base * 2^retry_count`
    #[default]
    Exponential,
    /// `base * (retry_count + 1)`
    Linear,
}

/// Bounded retry policy.
///
/// `retry_count` is the number of retries already performed, so the first
/// retry is asked for with `retry_count == 0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed while `retry_count < max_retries`. `None` means unbounded.
    pub max_retries: Option<u32>,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(500), Duration::from_secs(60))
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: Some(0),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Always retry after `delay`.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            max_retries: None,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries: Some(max_retries),
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn should_retry(&self, retry_count: u32) -> bool {
        self.max_retries.is_none_or(|max| retry_count < max)
    }

    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(retry_count.saturating_add(1)),
        };
        delay.min(self.max_delay.max(self.base_delay))
    }

    /// Stamp retry advice onto `error` for the given retry count.
    pub fn advise(&self, error: ClassifiedError, retry_count: u32) -> ClassifiedError {
        if self.should_retry(retry_count) {
            error.with_retry(self.delay_for_retry(retry_count))
        } else {
            error.not_retryable()
        }
    }
}
