//! Typed errors for the sync core.
//!
//! The taxonomy drives retry and circuit-breaker decisions: transient
//! errors re-enter the guarded call path, client/validation errors never do,
//! and durable-store errors are recovered locally by the orchestrator.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the sync core.
#[derive(Debug, Error)]
pub enum SyncError {
  /// Missing or unusable configuration (e.g. no API token). Fatal to the
  /// call, not to the process.
  #[error("configuration error: {0}")]
  Configuration(String),

  /// Request rejected by the rate limiter or the upstream's 429 response.
  #[error("rate limited on '{key}'")]
  RateLimited {
    key: String,
    /// Time until the saturated window frees a slot, when known.
    retry_after: Option<Duration>,
  },

  /// Upstream returned a 5xx response.
  #[error("upstream server error (status {status}): {detail}")]
  UpstreamServer { status: u16, detail: String },

  /// Upstream returned a non-retryable 4xx response.
  #[error("upstream client error (status {status}): {detail}")]
  UpstreamClient { status: u16, detail: String },

  /// Connection-level failure before any status was received.
  #[error("upstream transport error: {0}")]
  Transport(String),

  /// The circuit breaker is open; no upstream call was attempted.
  #[error("upstream unavailable: circuit breaker is open")]
  CircuitOpen,

  /// Malformed webhook payload or other invalid input.
  #[error("validation error: {0}")]
  Validation(String),

  /// The optional durable store failed. Recovered locally by the
  /// orchestrator, surfaced only through the audit trail.
  #[error("durable store error: {0}")]
  DurableStore(String),

  /// A full sync is already running (single-flight guard).
  #[error("a full sync is already in progress")]
  SyncInProgress,
}

impl SyncError {
  /// Whether the retry policy may re-attempt the call.
  pub fn is_transient(&self) -> bool {
    matches!(
      self,
      SyncError::RateLimited { .. } | SyncError::UpstreamServer { .. } | SyncError::Transport(_)
    )
  }

  /// Whether the failure counts toward opening the circuit breaker.
  /// Rate limiting and caller mistakes say nothing about upstream health.
  pub fn counts_toward_breaker(&self) -> bool {
    matches!(
      self,
      SyncError::UpstreamServer { .. } | SyncError::Transport(_)
    )
  }

  /// Server-provided or limiter-computed delay hint, if any.
  pub fn retry_after(&self) -> Option<Duration> {
    match self {
      SyncError::RateLimited { retry_after, .. } => *retry_after,
      _ => None,
    }
  }
}
