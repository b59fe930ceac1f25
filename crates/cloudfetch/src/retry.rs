//! Exponential backoff with jitter
//!
//! Attempt `n` (1-based) waits `min(max_delay, base_delay * 2^(n-1))` plus a
//! random jitter in `[0, max_jitter)`.

use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;

/// Retry policy derived from [`RetryConfig`]
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Attempts allowed per chunk, including the first
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Whether another attempt is allowed after `attempt` attempts failed
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts()
    }

    /// Backoff before retrying after failed attempt `attempt`, without jitter
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .config
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.config.max_delay);
        delay.min(self.config.max_delay)
    }

    /// Backoff before retrying after failed attempt `attempt`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff(attempt);
        let jitter_bound = self.config.max_jitter.as_millis() as u64;
        if jitter_bound == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..jitter_bound);
        base + Duration::from_millis(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
