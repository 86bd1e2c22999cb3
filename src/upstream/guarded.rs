//! The guarded upstream call path.
//!
//! Every network call passes the circuit breaker, then the rate limiter,
//! then runs under the retry policy. A retry is a brand-new guarded call:
//! the closure given to the retry policy re-enters both checks, so backing
//! off never bypasses admission control.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::SyncError;
use crate::guard::{CircuitBreaker, RateLimiter, RetryPolicy};

use super::types::{ChangeAction, ExternalRecord};
use super::Upstream;

/// Per-endpoint limiter keys.
pub mod endpoint {
  pub const RECORDS: &str = "records";
  pub const CHANGES: &str = "changes";
  pub const RECORD: &str = "record";
}

/// Upstream access composed with the full guard stack.
pub struct GuardedUpstream {
  inner: Arc<dyn Upstream>,
  limiter: Arc<RateLimiter>,
  breaker: Arc<CircuitBreaker>,
  retry: RetryPolicy,
}

impl GuardedUpstream {
  pub fn new(
    inner: Arc<dyn Upstream>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
  ) -> Self {
    Self {
      inner,
      limiter,
      breaker,
      retry,
    }
  }

  pub async fn list_records(&self) -> Result<Vec<ExternalRecord>, SyncError> {
    self
      .guarded(endpoint::RECORDS, || self.inner.list_records())
      .await
  }

  pub async fn changes_since(&self, since: DateTime<Utc>) -> Result<Vec<ChangeAction>, SyncError> {
    self
      .guarded(endpoint::CHANGES, || self.inner.changes_since(since))
      .await
  }

  pub async fn get_record(&self, id: &str) -> Result<ExternalRecord, SyncError> {
    self
      .guarded(endpoint::RECORD, || self.inner.get_record(id))
      .await
  }

  /// Read-only breaker snapshot for the health surface.
  pub fn breaker_status(&self) -> crate::guard::CircuitBreakerStatus {
    self.breaker.status()
  }

  /// Read-only limiter snapshot for one endpoint key.
  pub fn limiter_status(&self, key: &str) -> crate::guard::RateLimiterStatus {
    self.limiter.status(key)
  }

  async fn guarded<T, F, Fut>(&self, key: &str, op: F) -> Result<T, SyncError>
  where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, SyncError>>,
  {
    self
      .retry
      .execute(|| async {
        self.breaker.check()?;

        if !self.limiter.allow(key) {
          // A limiter rejection is not a trial verdict; free the slot.
          self.breaker.record_trial_abort();
          return Err(SyncError::RateLimited {
            key: key.to_string(),
            retry_after: self.limiter.retry_after(key),
          });
        }

        match op().await {
          Ok(value) => {
            self.breaker.record_success();
            Ok(value)
          }
          Err(err) => {
            if err.counts_toward_breaker() {
              self.breaker.record_failure();
            } else {
              self.breaker.record_trial_abort();
            }
            Err(err)
          }
        }
      })
      .await
  }
}
