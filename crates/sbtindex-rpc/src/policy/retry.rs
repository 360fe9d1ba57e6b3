//! Bounded retry policy.
//!
//! Rate-limit responses sleep until the provider's reset hint; other transient
//! errors back off exponentially. Every sleep is capped at `max_backoff`.

use std::time::Duration;

use crate::error::TransportError;

/// Configuration for the retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry of a non-rate-limit error.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
    /// Multiplier applied to backoff on each retry.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

/// Stateless retry policy. Computes the next delay given the attempt number.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay before retrying after `attempt` (1-based) failed with `err`.
    /// `None` when the error is not retryable or the attempts are used up.
    pub fn next_delay(&self, attempt: u32, err: &TransportError) -> Option<Duration> {
        if !err.is_retryable() || attempt >= self.config.max_attempts {
            return None;
        }
        let delay = match err {
            TransportError::RateLimited {
                retry_after: Some(reset),
                ..
            } => *reset,
            _ => self.backoff(attempt),
        };
        Some(delay.min(self.config.max_backoff))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.config.multiplier.powi(attempt.saturating_sub(1) as i32);
        let ms = self.config.initial_backoff.as_millis() as f64 * exp;
        let cap = self.config.max_backoff.as_millis() as f64;
        Duration::from_millis(ms.min(cap) as u64)
    }
}
