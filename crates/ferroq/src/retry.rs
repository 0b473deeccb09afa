//! Retry policies for failed tasks.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry strategy enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryStrategy {
    /// No retry.
    None,
    /// Fixed delay between retries.
    Fixed,
    /// Exponential backoff with optional jitter.
    Exponential,
}

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retry strategy.
    pub strategy: RetryStrategy,

    /// Maximum number of retries.
    pub max_retries: u32,

    /// Initial delay in milliseconds.
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds.
    pub max_delay_ms: u64,

    /// Backoff multiplier.
    pub multiplier: f64,

    /// Add random jitter to delays.
    pub jitter: bool,

    /// Jitter factor (0.0 to 1.0).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3)
    }
}

impl RetryPolicy {
    /// Creates a policy with no retries.
    pub fn none() -> Self {
        Self {
            strategy: RetryStrategy::None,
            max_retries: 0,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter: false,
            jitter_factor: 0.0,
        }
    }

    /// Creates a fixed delay retry policy.
    pub fn fixed(max_retries: u32, delay_ms: u64) -> Self {
        Self {
            strategy: RetryStrategy::Fixed,
            max_retries,
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            multiplier: 1.0,
            jitter: false,
            jitter_factor: 0.0,
        }
    }

    /// Creates an exponential backoff retry policy.
    pub fn exponential(max_retries: u32) -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            max_retries,
            initial_delay_ms: 1000,
            max_delay_ms: 3_600_000,
            multiplier: 2.0,
            jitter: true,
            jitter_factor: 0.1,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Returns the delay before the next attempt.
    ///
    /// `attempt` is the number of attempts already made (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = match self.strategy {
            RetryStrategy::None => 0.0,
            RetryStrategy::Fixed => self.initial_delay_ms as f64,
            RetryStrategy::Exponential => {
                let exponent = attempt.saturating_sub(1).min(32) as i32;
                self.initial_delay_ms as f64 * self.multiplier.powi(exponent)
            }
        };

        let capped_ms = base_ms.min(self.max_delay_ms as f64);

        let final_ms = if self.jitter && self.jitter_factor > 0.0 && capped_ms > 0.0 {
            let spread = rand::rng().random_range(-self.jitter_factor..=self.jitter_factor);
            (capped_ms * (1.0 + spread)).max(0.0)
        } else {
            capped_ms
        };

        Duration::from_millis(final_ms as u64)
    }
}
