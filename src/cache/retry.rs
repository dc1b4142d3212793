//! Retry with exponential backoff for transient fetch failures.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use super::key::ResourceKey;
use crate::error::FetchError;

/// How many times to attempt a fetch and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts, including the first one. Zero behaves like one.
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(30),
    }
  }
}

impl RetryPolicy {
  /// A policy that makes exactly one attempt.
  pub fn none() -> Self {
    Self {
      max_attempts: 1,
      ..Self::default()
    }
  }

  pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = max_attempts;
    self
  }

  /// Delay before the attempt following failed attempt number `failed`
  /// (1-based): `base * 2^(failed - 1)`, capped at `max_delay`.
  pub fn delay_after(&self, failed: u32) -> Duration {
    let exponent = failed.saturating_sub(1).min(31);
    self
      .base_delay
      .checked_mul(1u32 << exponent)
      .unwrap_or(self.max_delay)
      .min(self.max_delay)
  }

  /// Whether a failure on attempt number `attempt` (1-based) should be retried.
  pub fn should_retry(&self, error: &FetchError, attempt: u32) -> bool {
    attempt < self.max_attempts && error.is_transient()
  }

  /// Run `op` until it succeeds, fails permanently, or runs out of attempts.
  pub async fn run<T, F, Fut>(&self, key: &ResourceKey, mut op: F) -> Result<T, FetchError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
  {
    let mut attempt = 1;
    loop {
      match op().await {
        Ok(value) => return Ok(value),
        Err(err) if self.should_retry(&err, attempt) => {
          let delay = self.delay_after(attempt);
          debug!(%key, attempt, ?delay, error = %err, "retrying fetch");
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(err) => return Err(err),
      }
    }
  }
}
