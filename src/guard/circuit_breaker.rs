//! Failure-threshold circuit breaker for the upstream call path.
//!
//! The breaker wraps only network calls; cache hits never touch it. The
//! Open -> Half-Open transition is checked lazily on the next call rather
//! than driven by a timer.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::SyncError;

/// Breaker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
  /// Passing all calls through.
  Closed,
  /// Rejecting all calls without touching upstream.
  Open,
  /// Admitting exactly one trial call.
  HalfOpen,
}

/// Read-only breaker snapshot for the health surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerStatus {
  pub state: CircuitState,
  pub consecutive_failures: u32,
  pub since_last_failure: Option<Duration>,
}

struct BreakerInner {
  state: CircuitState,
  consecutive_failures: u32,
  last_failure_at: Option<Instant>,
  /// Set while the single half-open trial call is in flight.
  trial_pending: bool,
}

pub struct CircuitBreaker {
  threshold: u32,
  cooldown: Duration,
  inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
  pub fn new(threshold: u32, cooldown: Duration) -> Self {
    Self {
      threshold: threshold.max(1),
      cooldown,
      inner: Mutex::new(BreakerInner {
        state: CircuitState::Closed,
        consecutive_failures: 0,
        last_failure_at: None,
        trial_pending: false,
      }),
    }
  }

  /// Gate a call. Returns `CircuitOpen` while open (and during a pending
  /// half-open trial); transitions Open -> Half-Open once the cooldown has
  /// elapsed since the last failure.
  pub fn check(&self) -> Result<(), SyncError> {
    let mut inner = self.inner.lock().expect("breaker lock poisoned");
    match inner.state {
      CircuitState::Closed => Ok(()),
      CircuitState::Open => {
        let cooled_down = inner
          .last_failure_at
          .map(|at| at.elapsed() >= self.cooldown)
          .unwrap_or(true);
        if cooled_down {
          inner.state = CircuitState::HalfOpen;
          inner.trial_pending = true;
          info!("circuit breaker cooled down, admitting trial call");
          Ok(())
        } else {
          Err(SyncError::CircuitOpen)
        }
      }
      CircuitState::HalfOpen => {
        if inner.trial_pending {
          Err(SyncError::CircuitOpen)
        } else {
          inner.trial_pending = true;
          Ok(())
        }
      }
    }
  }

  /// Record a successful guarded call. Closes the breaker and resets the
  /// failure counter.
  pub fn record_success(&self) {
    let mut inner = self.inner.lock().expect("breaker lock poisoned");
    if inner.state != CircuitState::Closed {
      info!("circuit breaker closed after successful call");
    }
    inner.state = CircuitState::Closed;
    inner.consecutive_failures = 0;
    inner.trial_pending = false;
  }

  /// Resolve a half-open trial that ended without a health signal (a 4xx
  /// or a limiter rejection). Re-arms the trial slot so the next call is
  /// admitted, without touching the failure streak. No-op outside a
  /// pending trial.
  pub fn record_trial_abort(&self) {
    let mut inner = self.inner.lock().expect("breaker lock poisoned");
    if inner.state == CircuitState::HalfOpen && inner.trial_pending {
      inner.trial_pending = false;
      info!("half-open trial ended without a health signal, re-arming");
    }
  }

  /// Record a breaker-counted failure. A failed half-open trial reopens
  /// immediately; a closed breaker opens at the threshold.
  pub fn record_failure(&self) {
    let mut inner = self.inner.lock().expect("breaker lock poisoned");
    inner.consecutive_failures += 1;
    inner.last_failure_at = Some(Instant::now());

    match inner.state {
      CircuitState::HalfOpen => {
        inner.state = CircuitState::Open;
        inner.trial_pending = false;
        warn!("circuit breaker reopened after failed trial call");
      }
      CircuitState::Closed if inner.consecutive_failures >= self.threshold => {
        inner.state = CircuitState::Open;
        warn!(
          failures = inner.consecutive_failures,
          "circuit breaker opened"
        );
      }
      _ => {}
    }
  }

  pub fn status(&self) -> CircuitBreakerStatus {
    let inner = self.inner.lock().expect("breaker lock poisoned");
    CircuitBreakerStatus {
      state: inner.state,
      consecutive_failures: inner.consecutive_failures,
      since_last_failure: inner.last_failure_at.map(|at| at.elapsed()),
    }
  }
}
