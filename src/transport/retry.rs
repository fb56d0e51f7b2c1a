//! Exponential backoff for transparent retries.

use std::time::Duration;

use crate::config::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub initial_delay: Duration,
  pub max_delay: Duration,
  /// Retries after the initial attempt
  pub max_retries: u32,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      initial_delay: Duration::from_millis(1000),
      max_delay: Duration::from_millis(30_000),
      max_retries: 3,
    }
  }
}

impl RetryPolicy {
  /// Never retry.
  pub fn none() -> Self {
    Self {
      max_retries: 0,
      ..Self::default()
    }
  }

  /// Delay before retry number `retry` (1-based): initial * 2^(retry-1), capped.
  pub fn delay_for(&self, retry: u32) -> Duration {
    let exponent = retry.saturating_sub(1).min(31);
    let delay = self
      .initial_delay
      .saturating_mul(1u32 << exponent);
    delay.min(self.max_delay)
  }
}

impl From<&RetryConfig> for RetryPolicy {
  fn from(config: &RetryConfig) -> Self {
    Self {
      initial_delay: Duration::from_millis(config.initial_delay_ms),
      max_delay: Duration::from_millis(config.max_delay_ms),
      max_retries: config.max_retries,
    }
  }
}
