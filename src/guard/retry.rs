//! Bounded exponential backoff around a single upstream call.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::SyncError;

/// Retry policy with a fixed ascending delay schedule.
///
/// The schedule bounds the attempt count: `schedule.len()` retries after
/// the initial attempt. Only transient errors are retried; exhausting the
/// schedule surfaces the last error unchanged. The operation closure is
/// re-invoked from scratch each attempt, so guard checks (breaker,
/// limiter) are re-entered rather than bypassed.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  schedule: Vec<Duration>,
}

impl RetryPolicy {
  pub fn new(schedule: Vec<Duration>) -> Self {
    Self { schedule }
  }

  /// The 1s/2s/4s/8s/16s production schedule.
  pub fn standard() -> Self {
    Self::new(
      [1, 2, 4, 8, 16]
        .into_iter()
        .map(Duration::from_secs)
        .collect(),
    )
  }

  /// Run `op`, retrying transient failures along the schedule. A
  /// rate-limit `retry_after` hint stretches the scheduled delay when the
  /// hint is longer, but never loops beyond the schedule.
  pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T, SyncError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
  {
    let mut attempt = 0usize;
    loop {
      match op().await {
        Ok(value) => return Ok(value),
        Err(err) if err.is_transient() && attempt < self.schedule.len() => {
          let mut delay = self.schedule[attempt];
          if let Some(hint) = err.retry_after() {
            delay = delay.max(hint);
          }
          warn!(
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient upstream failure, backing off"
          );
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(err) => return Err(err),
      }
    }
  }
}
