//! Best-effort, in-memory freshness event fan-out.
//!
//! Dispatch is synchronous per subscriber but isolated: the subscriber list
//! is snapshotted before dispatch (callbacks may subscribe or unsubscribe
//! reentrantly) and a panicking callback is caught so the rest still get
//! the event. Nothing survives a process restart.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{error, trace};

/// Closed set of freshness events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncEventKind {
  RecordCreated,
  RecordUpdated,
  RecordDeleted,
  /// The full record list was refreshed (poll or full sync rewrite).
  RecordsRefreshed,
  /// Container/status metadata changed; derived statuses may shift.
  PipelinesChanged,
  SyncCompleted,
  SyncFailed,
}

/// A freshness event delivered to subscribers.
#[derive(Debug, Clone)]
pub struct SyncEvent {
  pub kind: SyncEventKind,
  pub record_id: Option<String>,
  pub detail: String,
  pub at: DateTime<Utc>,
}

impl SyncEvent {
  pub fn new(kind: SyncEventKind, record_id: Option<String>, detail: impl Into<String>) -> Self {
    Self {
      kind,
      record_id,
      detail: detail.into(),
      at: Utc::now(),
    }
  }
}

type Callback = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

struct Subscription {
  interests: HashSet<SyncEventKind>,
  enabled: bool,
  callback: Callback,
}

/// Typed pub/sub hub for sync events.
pub struct Notifier {
  subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl Notifier {
  pub fn new() -> Self {
    Self {
      subscriptions: Mutex::new(HashMap::new()),
    }
  }

  /// Register (or replace) a subscriber. An empty interest set means
  /// "everything".
  pub fn subscribe(
    &self,
    id: impl Into<String>,
    interests: HashSet<SyncEventKind>,
    callback: impl Fn(&SyncEvent) + Send + Sync + 'static,
  ) {
    let mut subs = self.subscriptions.lock().expect("notifier lock poisoned");
    subs.insert(
      id.into(),
      Subscription {
        interests,
        enabled: true,
        callback: Arc::new(callback),
      },
    );
  }

  /// Remove a subscriber. Returns whether it existed.
  pub fn unsubscribe(&self, id: &str) -> bool {
    let mut subs = self.subscriptions.lock().expect("notifier lock poisoned");
    subs.remove(id).is_some()
  }

  /// Pause or resume a subscriber without losing its registration.
  pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
    let mut subs = self.subscriptions.lock().expect("notifier lock poisoned");
    match subs.get_mut(id) {
      Some(sub) => {
        sub.enabled = enabled;
        true
      }
      None => false,
    }
  }

  pub fn subscriber_count(&self) -> usize {
    self.subscriptions.lock().expect("notifier lock poisoned").len()
  }

  /// Deliver an event to every enabled subscriber whose interest set
  /// includes its kind.
  pub fn emit(&self, event: SyncEvent) {
    let interested: Vec<(String, Callback)> = {
      let subs = self.subscriptions.lock().expect("notifier lock poisoned");
      subs
        .iter()
        .filter(|(_, sub)| {
          sub.enabled && (sub.interests.is_empty() || sub.interests.contains(&event.kind))
        })
        .map(|(id, sub)| (id.clone(), Arc::clone(&sub.callback)))
        .collect()
    };

    trace!(kind = ?event.kind, subscribers = interested.len(), "dispatching sync event");
    for (id, callback) in interested {
      if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
        error!(subscriber = %id, kind = ?event.kind, "subscriber panicked during dispatch");
      }
    }
  }
}

impl Default for Notifier {
  fn default() -> Self {
    Self::new()
  }
}
