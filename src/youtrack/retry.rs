//! Retry with capped exponential backoff.

use std::future::Future;
use std::time::Duration;

use super::error::ClassifiedFailure;

/// How many times to retry a failed request, and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Retries after the first attempt; total attempts are `max_retries + 1`
  pub max_retries: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(10),
    }
  }
}

impl RetryPolicy {
  pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
    Self {
      max_retries,
      base_delay,
      max_delay,
    }
  }

  /// A policy that makes exactly one attempt.
  pub fn none() -> Self {
    Self {
      max_retries: 0,
      ..Self::default()
    }
  }

  /// Delay before the retry that follows failed attempt `attempt` (0-based):
  /// `min(base * 2^attempt, cap)`.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    2u32
      .checked_pow(attempt)
      .and_then(|factor| self.base_delay.checked_mul(factor))
      .map_or(self.max_delay, |delay| delay.min(self.max_delay))
  }

  /// Run `attempt` until it succeeds, fails with a client error, or the
  /// retry budget is spent. The last error is returned on exhaustion.
  pub async fn run<F, Fut, T>(&self, operation: &str, mut attempt: F) -> Result<T, ClassifiedFailure>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClassifiedFailure>>,
  {
    let mut tries = 0u32;
    loop {
      let err = match attempt().await {
        Ok(value) => return Ok(value),
        Err(err) => err,
      };

      if err.is_client() {
        tracing::debug!(operation, error = %err, "client error, not retrying");
        return Err(err);
      }
      if tries >= self.max_retries {
        tracing::warn!(operation, attempts = tries + 1, error = %err, "giving up");
        return Err(err);
      }

      let delay = self.delay_for(tries);
      tracing::warn!(
        operation,
        attempt = tries + 1,
        delay_ms = delay.as_millis() as u64,
        error = %err,
        "request failed, retrying"
      );
      tokio::time::sleep(delay).await;
      tries += 1;
    }
  }
}
