//! Sliding-window request admission per upstream endpoint.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::trace;

/// Read-only limiter state for the health surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterStatus {
  pub key: String,
  pub in_window: usize,
  pub ceiling: usize,
  pub window: Duration,
}

/// Per-key sliding-window rate limiter.
///
/// `allow` never blocks: a saturated window rejects immediately and the
/// caller decides whether to delay a single bounded retry using
/// `retry_after`.
pub struct RateLimiter {
  ceiling: usize,
  window: Duration,
  windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
  pub fn new(ceiling: usize, window: Duration) -> Self {
    Self {
      ceiling: ceiling.max(1),
      window,
      windows: Mutex::new(HashMap::new()),
    }
  }

  /// Admit a request for `key` iff fewer than the ceiling landed within the
  /// window. Admission records the request timestamp.
  pub fn allow(&self, key: &str) -> bool {
    let now = Instant::now();
    let mut windows = self.windows.lock().expect("limiter lock poisoned");
    let timestamps = windows.entry(key.to_string()).or_default();
    Self::prune(timestamps, now, self.window);

    if timestamps.len() < self.ceiling {
      timestamps.push_back(now);
      true
    } else {
      trace!(key, in_window = timestamps.len(), "rate limiter rejected");
      false
    }
  }

  /// Time until the oldest in-window request ages out, freeing a slot.
  /// `None` when the window has room already.
  pub fn retry_after(&self, key: &str) -> Option<Duration> {
    let now = Instant::now();
    let mut windows = self.windows.lock().expect("limiter lock poisoned");
    let timestamps = windows.get_mut(key)?;
    Self::prune(timestamps, now, self.window);

    if timestamps.len() < self.ceiling {
      return None;
    }
    let oldest = *timestamps.front()?;
    Some(self.window.saturating_sub(now.duration_since(oldest)))
  }

  /// Snapshot in-window usage for `key`.
  pub fn status(&self, key: &str) -> RateLimiterStatus {
    let now = Instant::now();
    let mut windows = self.windows.lock().expect("limiter lock poisoned");
    let in_window = match windows.get_mut(key) {
      Some(timestamps) => {
        Self::prune(timestamps, now, self.window);
        timestamps.len()
      }
      None => 0,
    };
    RateLimiterStatus {
      key: key.to_string(),
      in_window,
      ceiling: self.ceiling,
      window: self.window,
    }
  }

  fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = timestamps.front() {
      if now.duration_since(*oldest) > window {
        timestamps.pop_front();
      } else {
        break;
      }
    }
  }
}
