//! Push-notification (webhook) processing.
//!
//! Payloads arrive as `{ action: { type, data: { record?, container?, old? } } }`.
//! Malformed events are rejected without side effects; unrecognized action
//! types are accepted and ignored so upstream can add event kinds without
//! breaking us. Recognized events invalidate the affected cache regions,
//! append an audit entry, and fan out through the notifier.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::cache::{CacheKey, TtlCache};
use crate::error::SyncError;
use crate::notify::{Notifier, SyncEvent, SyncEventKind};
use crate::store::{DurableStore, SyncAction, SyncHistoryEntry, SyncSource};
use crate::upstream::types::CacheValue;
use crate::upstream::GuardedUpstream;

/// Webhook ingress payload.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
  pub action: WebhookAction,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookAction {
  #[serde(rename = "type", default)]
  pub kind: String,
  #[serde(default)]
  pub data: WebhookData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookData {
  #[serde(default)]
  pub record: Option<WebhookRecordRef>,
  #[serde(default)]
  pub container: Option<WebhookContainerRef>,
  /// Previous field values, present on update/move events.
  #[serde(default)]
  pub old: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookRecordRef {
  pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookContainerRef {
  pub id: String,
  #[serde(default)]
  pub name: Option<String>,
}

/// What processing an event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
  pub accepted: bool,
  pub invalidated: bool,
  pub error: Option<String>,
}

impl ProcessOutcome {
  fn rejected(error: SyncError) -> Self {
    Self {
      accepted: false,
      invalidated: false,
      error: Some(error.to_string()),
    }
  }

  fn ignored() -> Self {
    Self {
      accepted: true,
      invalidated: false,
      error: None,
    }
  }

  fn invalidated() -> Self {
    Self {
      accepted: true,
      invalidated: true,
      error: None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventClass {
  RecordCreated,
  RecordUpdated,
  RecordDeleted,
  RecordMoved,
  ContainerRenamed,
  Ignorable,
}

/// Map raw upstream action types onto cache-effect classes. Comments and
/// attachments have no cache effect. Returns `None` for unrecognized types.
fn classify(action: &WebhookAction) -> Option<EventClass> {
  match action.kind.as_str() {
    "createCard" | "createRecord" => Some(EventClass::RecordCreated),
    "updateCard" | "updateRecord" => {
      // An update carrying the old container is a move between columns.
      let moved = action
        .data
        .old
        .as_ref()
        .map(|old| old.get("container").is_some())
        .unwrap_or(false);
      if moved {
        Some(EventClass::RecordMoved)
      } else {
        Some(EventClass::RecordUpdated)
      }
    }
    "moveCard" | "moveRecord" | "moveCardToBoard" => Some(EventClass::RecordMoved),
    "deleteCard" | "deleteRecord" => Some(EventClass::RecordDeleted),
    "renameContainer" | "renameList" | "updateList" | "updateContainer" => {
      Some(EventClass::ContainerRenamed)
    }
    "commentCard" | "commentRecord" | "addAttachmentToCard" | "deleteAttachmentFromCard"
    | "addChecklistToCard" => Some(EventClass::Ignorable),
    _ => None,
  }
}

/// Validates, classifies, and applies webhook events, queueing bursts so
/// events are processed strictly in arrival order.
pub struct WebhookProcessor {
  upstream: Arc<GuardedUpstream>,
  cache: Arc<TtlCache<CacheValue>>,
  store: Arc<dyn DurableStore>,
  notifier: Arc<Notifier>,
  record_ttl: Duration,
  batch_size: usize,
  batch_pause: Duration,
  queue: Mutex<VecDeque<WebhookPayload>>,
  draining: AtomicBool,
}

impl WebhookProcessor {
  pub fn new(
    upstream: Arc<GuardedUpstream>,
    cache: Arc<TtlCache<CacheValue>>,
    store: Arc<dyn DurableStore>,
    notifier: Arc<Notifier>,
    record_ttl: Duration,
    batch_size: usize,
    batch_pause: Duration,
  ) -> Self {
    Self {
      upstream,
      cache,
      store,
      notifier,
      record_ttl,
      batch_size: batch_size.max(1),
      batch_pause,
      queue: Mutex::new(VecDeque::new()),
      draining: AtomicBool::new(false),
    }
  }

  /// Enqueue an event for FIFO processing. Returns the queue depth.
  pub fn submit(&self, payload: WebhookPayload) -> usize {
    let mut queue = self.queue.lock().expect("webhook queue lock poisoned");
    queue.push_back(payload);
    queue.len()
  }

  /// Drain the queue in fixed-size batches with a short pause between
  /// batches, so a webhook burst cannot saturate the rate limiter. Only
  /// one drainer runs at a time; concurrent callers return immediately
  /// and leave their events for the active drainer. Returns how many
  /// events were processed.
  pub async fn drain(&self) -> usize {
    if self.draining.swap(true, Ordering::SeqCst) {
      return 0;
    }

    let mut processed = 0;
    loop {
      let batch: Vec<WebhookPayload> = {
        let mut queue = self.queue.lock().expect("webhook queue lock poisoned");
        let take = self.batch_size.min(queue.len());
        queue.drain(..take).collect()
      };
      if batch.is_empty() {
        break;
      }

      for payload in &batch {
        self.process(payload).await;
        processed += 1;
      }

      let more_pending = !self.queue.lock().expect("webhook queue lock poisoned").is_empty();
      if more_pending {
        tokio::time::sleep(self.batch_pause).await;
      }
    }

    self.draining.store(false, Ordering::SeqCst);
    processed
  }

  /// Process one event. Safe to replay: reprocessing an event invalidates
  /// the same regions again without corrupting state.
  pub async fn process(&self, payload: &WebhookPayload) -> ProcessOutcome {
    let action = &payload.action;
    if action.kind.trim().is_empty() {
      return ProcessOutcome::rejected(SyncError::Validation(
        "malformed event: missing action type".into(),
      ));
    }

    let class = match classify(action) {
      Some(EventClass::Ignorable) => {
        debug!(kind = %action.kind, "webhook event has no cache effect");
        return ProcessOutcome::ignored();
      }
      Some(class) => class,
      None => {
        debug!(kind = %action.kind, "unrecognized webhook event type, ignoring");
        return ProcessOutcome::ignored();
      }
    };

    match class {
      EventClass::RecordCreated | EventClass::RecordUpdated | EventClass::RecordMoved => {
        let Some(record_ref) = action.data.record.as_ref() else {
          return ProcessOutcome::rejected(SyncError::Validation(format!(
            "malformed event: '{}' is missing a record id",
            action.kind
          )));
        };
        self.refresh_record(&record_ref.id, class).await
      }
      EventClass::RecordDeleted => {
        let Some(record_ref) = action.data.record.as_ref() else {
          return ProcessOutcome::rejected(SyncError::Validation(format!(
            "malformed event: '{}' is missing a record id",
            action.kind
          )));
        };
        self.apply_delete(&record_ref.id)
      }
      EventClass::ContainerRenamed => self.apply_container_rename(action),
      EventClass::Ignorable => unreachable!("handled above"),
    }
  }

  /// Read-through refetch of the single affected record, bypassing the
  /// list cache but still passing every guard. The fresh record replaces
  /// `record:<id>` and the list region is invalidated.
  async fn refresh_record(&self, id: &str, class: EventClass) -> ProcessOutcome {
    let (sync_action, event_kind) = match class {
      EventClass::RecordCreated => (SyncAction::Created, SyncEventKind::RecordCreated),
      _ => (SyncAction::Updated, SyncEventKind::RecordUpdated),
    };

    match self.upstream.get_record(id).await {
      Ok(record) => {
        let key = CacheKey::Record { id: id.to_string() }.render();
        self.cache.set(&key, CacheValue::Record(record.clone()), self.record_ttl);
        self.cache.delete(&CacheKey::RecordsList.render());
        self.cache.invalidate_by_pattern(CacheKey::search_region());

        if let Err(err) = self.store.upsert(&record) {
          warn!(id, error = %err, "durable store upsert failed, continuing");
        }

        self.audit(SyncHistoryEntry::new(
          Some(id.to_string()),
          sync_action,
          SyncSource::Webhook,
          true,
          format!("refetched record after {:?}", class),
        ));
        self.notifier.emit(SyncEvent::new(
          event_kind,
          Some(id.to_string()),
          "record refreshed from webhook",
        ));
        ProcessOutcome::invalidated()
      }
      Err(err) => {
        warn!(id, error = %err, "single-record refetch failed");
        self.audit(SyncHistoryEntry::new(
          Some(id.to_string()),
          SyncAction::Error,
          SyncSource::Webhook,
          false,
          err.to_string(),
        ));
        ProcessOutcome {
          accepted: true,
          invalidated: false,
          error: Some(err.to_string()),
        }
      }
    }
  }

  /// Deletions need no upstream fetch: drop the cached copies and the
  /// durable row.
  fn apply_delete(&self, id: &str) -> ProcessOutcome {
    self.cache.delete(&CacheKey::Record { id: id.to_string() }.render());
    self.cache.delete(&CacheKey::RecordsList.render());
    self.cache.invalidate_by_pattern(CacheKey::search_region());

    match self.store.delete(id) {
      Ok(_) => {}
      Err(err) => warn!(id, error = %err, "durable store delete failed, continuing"),
    }

    self.audit(SyncHistoryEntry::new(
      Some(id.to_string()),
      SyncAction::Deleted,
      SyncSource::Webhook,
      true,
      "record deleted upstream",
    ));
    self.notifier.emit(SyncEvent::new(
      SyncEventKind::RecordDeleted,
      Some(id.to_string()),
      "record deleted upstream",
    ));
    ProcessOutcome::invalidated()
  }

  /// Status derivation depends on container names, so a rename stales the
  /// pipeline metadata, the full list, and every cached single record
  /// (each one carries the stale container name).
  fn apply_container_rename(&self, action: &WebhookAction) -> ProcessOutcome {
    self.cache.delete(&CacheKey::Pipelines.render());
    self.cache.delete(&CacheKey::RecordsList.render());
    self.cache.invalidate_by_pattern(CacheKey::record_region());
    self.cache.invalidate_by_pattern(CacheKey::search_region());

    let detail = match action.data.container.as_ref() {
      Some(c) => format!(
        "container {} renamed to '{}'",
        c.id,
        c.name.as_deref().unwrap_or("unknown")
      ),
      None => "container renamed".to_string(),
    };

    self.audit(SyncHistoryEntry::new(
      None,
      SyncAction::Updated,
      SyncSource::Webhook,
      true,
      detail.clone(),
    ));
    self.notifier.emit(SyncEvent::new(
      SyncEventKind::PipelinesChanged,
      None,
      detail,
    ));
    ProcessOutcome::invalidated()
  }

  fn audit(&self, entry: SyncHistoryEntry) {
    if let Err(err) = self.store.append_history(&entry) {
      warn!(error = %err, "failed to append sync history entry");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::guard::{CircuitBreaker, RateLimiter, RetryPolicy};
  use crate::store::SqliteStore;
  use crate::upstream::testing::{sample_record, ScriptedUpstream};
  use serde_json::json;
  use std::sync::atomic::AtomicU32;
  use std::sync::atomic::Ordering as AtomicOrdering;

  const TTL: Duration = Duration::from_secs(300);

  struct Fixture {
    upstream: Arc<ScriptedUpstream>,
    cache: Arc<TtlCache<CacheValue>>,
    store: Arc<SqliteStore>,
    notifier: Arc<Notifier>,
    processor: WebhookProcessor,
  }

  fn fixture(records: Vec<crate::upstream::types::ExternalRecord>) -> Fixture {
    let upstream = Arc::new(ScriptedUpstream::new(records));
    let guarded = Arc::new(GuardedUpstream::new(
      upstream.clone(),
      Arc::new(RateLimiter::new(100, Duration::from_secs(60))),
      Arc::new(CircuitBreaker::new(5, Duration::from_secs(30))),
      RetryPolicy::new(vec![]),
    ));
    let cache = Arc::new(TtlCache::new(50));
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let notifier = Arc::new(Notifier::new());
    let processor = WebhookProcessor::new(
      guarded,
      cache.clone(),
      store.clone(),
      notifier.clone(),
      TTL,
      2,
      Duration::from_millis(1),
    );
    Fixture {
      upstream,
      cache,
      store,
      notifier,
      processor,
    }
  }

  fn payload(value: serde_json::Value) -> WebhookPayload {
    serde_json::from_value(value).unwrap()
  }

  fn update_card(id: &str) -> WebhookPayload {
    payload(json!({ "action": { "type": "updateCard", "data": { "record": { "id": id } } } }))
  }

  #[tokio::test]
  async fn test_missing_type_rejected_without_side_effects() {
    let fx = fixture(vec![]);
    let outcome = fx
      .processor
      .process(&payload(json!({ "action": { "data": {} } })))
      .await;

    assert!(!outcome.accepted);
    assert!(outcome.error.is_some());
    assert_eq!(fx.upstream.get_calls.load(AtomicOrdering::SeqCst), 0);
    assert_eq!(fx.store.recent_history(10).unwrap().len(), 0);
  }

  #[tokio::test]
  async fn test_record_event_without_id_rejected() {
    let fx = fixture(vec![]);
    let outcome = fx
      .processor
      .process(&payload(json!({ "action": { "type": "updateCard", "data": {} } })))
      .await;

    assert!(!outcome.accepted);
    assert_eq!(fx.upstream.get_calls.load(AtomicOrdering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_unrecognized_type_accepted_and_ignored() {
    let fx = fixture(vec![]);
    let outcome = fx
      .processor
      .process(&payload(json!({ "action": { "type": "pluginCustomEvent", "data": {} } })))
      .await;

    assert!(outcome.accepted);
    assert!(!outcome.invalidated);
    assert!(outcome.error.is_none());
  }

  #[tokio::test]
  async fn test_comment_event_has_no_cache_effect() {
    let fx = fixture(vec![]);
    fx.cache.set(
      &CacheKey::RecordsList.render(),
      CacheValue::RecordList(vec![]),
      TTL,
    );

    let outcome = fx
      .processor
      .process(&payload(json!({
        "action": { "type": "commentCard", "data": { "record": { "id": "crd-1" } } }
      })))
      .await;

    assert!(outcome.accepted);
    assert!(!outcome.invalidated);
    assert!(fx.cache.get(&CacheKey::RecordsList.render()).is_some());
  }

  #[tokio::test]
  async fn test_update_refetches_and_invalidates() {
    let fresh = sample_record("crd-1", "Fix login flow", "In Progress");
    let fx = fixture(vec![fresh.clone()]);

    // Stale copies in cache.
    fx.cache.set(
      &CacheKey::Record { id: "crd-1".into() }.render(),
      CacheValue::Record(sample_record("crd-1", "Fix login flow", "Open")),
      TTL,
    );
    fx.cache.set(
      &CacheKey::RecordsList.render(),
      CacheValue::RecordList(vec![]),
      TTL,
    );
    fx.cache.set(
      &CacheKey::Search { query: "login".into() }.render(),
      CacheValue::RecordList(vec![]),
      TTL,
    );

    let fired = Arc::new(AtomicU32::new(0));
    let fired_clone = fired.clone();
    fx.notifier.subscribe(
      "test",
      std::collections::HashSet::from([SyncEventKind::RecordUpdated]),
      move |_| {
        fired_clone.fetch_add(1, AtomicOrdering::SeqCst);
      },
    );

    let outcome = fx.processor.process(&update_card("crd-1")).await;

    assert!(outcome.accepted && outcome.invalidated);
    assert_eq!(fx.upstream.get_calls.load(AtomicOrdering::SeqCst), 1);

    // record:<id> now holds the fresh copy; the list region is gone.
    let cached = fx
      .cache
      .get(&CacheKey::Record { id: "crd-1".into() }.render())
      .unwrap();
    assert_eq!(cached.as_record().unwrap().status_raw, "In Progress");
    assert!(fx.cache.get(&CacheKey::RecordsList.render()).is_none());
    assert!(fx
      .cache
      .get(&CacheKey::Search { query: "login".into() }.render())
      .is_none());

    // Durable copy, audit entry, and notification.
    assert!(fx.store.find_by_id("crd-1").unwrap().is_some());
    let history = fx.store.recent_history(10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].source, SyncSource::Webhook);
    assert_eq!(fired.load(AtomicOrdering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_update_with_old_container_classified_as_move() {
    let fx = fixture(vec![sample_record("crd-1", "Fix login flow", "Done")]);

    let outcome = fx
      .processor
      .process(&payload(json!({
        "action": {
          "type": "updateCard",
          "data": {
            "record": { "id": "crd-1" },
            "old": { "container": { "id": "col-2", "name": "In Progress" } }
          }
        }
      })))
      .await;

    assert!(outcome.invalidated);
    // Moves refetch like updates do.
    assert_eq!(fx.upstream.get_calls.load(AtomicOrdering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_delete_invalidates_without_fetching() {
    let fx = fixture(vec![]);
    fx.store.upsert(&sample_record("crd-1", "Old", "Open")).unwrap();
    fx.cache.set(
      &CacheKey::Record { id: "crd-1".into() }.render(),
      CacheValue::Record(sample_record("crd-1", "Old", "Open")),
      TTL,
    );
    fx.cache.set(
      &CacheKey::RecordsList.render(),
      CacheValue::RecordList(vec![]),
      TTL,
    );

    let outcome = fx
      .processor
      .process(&payload(json!({
        "action": { "type": "deleteCard", "data": { "record": { "id": "crd-1" } } }
      })))
      .await;

    assert!(outcome.invalidated);
    assert_eq!(fx.upstream.get_calls.load(AtomicOrdering::SeqCst), 0);
    assert!(fx.cache.get(&CacheKey::Record { id: "crd-1".into() }.render()).is_none());
    assert!(fx.cache.get(&CacheKey::RecordsList.render()).is_none());
    assert!(fx.store.find_by_id("crd-1").unwrap().is_none());
  }

  #[tokio::test]
  async fn test_container_rename_invalidates_derived_regions() {
    let fx = fixture(vec![]);
    fx.cache.set(&CacheKey::Pipelines.render(), CacheValue::Pipelines(vec!["Open".into()]), TTL);
    fx.cache.set(
      &CacheKey::RecordsList.render(),
      CacheValue::RecordList(vec![]),
      TTL,
    );
    // Cached single records carry the old container name too.
    fx.cache.set(
      &CacheKey::Record { id: "crd-1".into() }.render(),
      CacheValue::Record(sample_record("crd-1", "Fix login flow", "Open")),
      TTL,
    );

    let outcome = fx
      .processor
      .process(&payload(json!({
        "action": {
          "type": "renameList",
          "data": { "container": { "id": "col-1", "name": "Doing" } }
        }
      })))
      .await;

    assert!(outcome.invalidated);
    assert!(fx.cache.get(&CacheKey::Pipelines.render()).is_none());
    assert!(fx.cache.get(&CacheKey::RecordsList.render()).is_none());
    assert!(fx.cache.get(&CacheKey::Record { id: "crd-1".into() }.render()).is_none());

    // The audit entry names both the container and its new name.
    let history = fx.store.recent_history(10).unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].detail.contains("col-1"));
    assert!(history[0].detail.contains("Doing"));
  }

  #[tokio::test]
  async fn test_refetch_failure_is_reported_not_crashed() {
    let fx = fixture(vec![]);
    fx.upstream.fail_next(1);

    let outcome = fx.processor.process(&update_card("crd-1")).await;

    assert!(outcome.accepted);
    assert!(!outcome.invalidated);
    assert!(outcome.error.is_some());

    let history = fx.store.recent_history(10).unwrap();
    assert_eq!(history.len(), 1);
    assert!(!history[0].success);
  }

  #[tokio::test]
  async fn test_replay_is_idempotent() {
    let fx = fixture(vec![sample_record("crd-1", "Fix login flow", "Open")]);

    let first = fx.processor.process(&update_card("crd-1")).await;
    let second = fx.processor.process(&update_card("crd-1")).await;

    assert_eq!(first, second);
    assert_eq!(fx.upstream.get_calls.load(AtomicOrdering::SeqCst), 2);
    let cached = fx
      .cache
      .get(&CacheKey::Record { id: "crd-1".into() }.render())
      .unwrap();
    assert_eq!(cached.as_record().unwrap().external_id, "crd-1");
  }

  #[tokio::test]
  async fn test_queue_drains_fifo_in_batches() {
    let fx = fixture(vec![]);

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    fx.notifier.subscribe(
      "order",
      std::collections::HashSet::from([SyncEventKind::RecordDeleted]),
      move |event| {
        seen_clone.lock().unwrap().push(event.record_id.clone().unwrap_or_default());
      },
    );

    for id in ["crd-1", "crd-2", "crd-3", "crd-4", "crd-5"] {
      fx.processor.submit(payload(json!({
        "action": { "type": "deleteCard", "data": { "record": { "id": id } } }
      })));
    }

    let processed = fx.processor.drain().await;
    assert_eq!(processed, 5);
    assert_eq!(
      *seen.lock().unwrap(),
      vec!["crd-1", "crd-2", "crd-3", "crd-4", "crd-5"]
    );
  }
}
