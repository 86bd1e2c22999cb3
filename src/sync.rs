//! Top-level sync coordination.
//!
//! The orchestrator owns the fallback chain (cache, then upstream, then
//! the durable store as a degraded last resort), guarantees at most one
//! concurrent full resync, and fans freshness events out to subscribers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheStats, TtlCache};
use crate::error::SyncError;
use crate::guard::{CircuitBreakerStatus, RateLimiterStatus};
use crate::notify::{Notifier, SyncEvent, SyncEventKind};
use crate::store::{DurableStore, RecordFilter, SyncAction, SyncHistoryEntry, SyncSource};
use crate::upstream::types::{BoardStats, CacheValue, ExternalRecord};
use crate::upstream::GuardedUpstream;

/// Where the records of one sync run came from and what happened to them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRunStats {
  pub fetched: usize,
  pub filtered_out: usize,
  pub persisted: usize,
  pub from_cache: bool,
  /// True when upstream failed and the durable store served the result.
  pub degraded: bool,
}

/// Result of a full sync.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
  pub records: Vec<ExternalRecord>,
  pub stats: SyncRunStats,
}

/// Rolling sync metrics for the health surface.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncMetrics {
  pub total: u64,
  pub succeeded: u64,
  pub failed: u64,
  /// Exponential moving average over completed syncs.
  pub avg_duration_ms: f64,
  pub last_sync_at: Option<DateTime<Utc>>,
}

/// Cancelable subscription handle returned by [`SyncOrchestrator::subscribe`].
pub struct SubscriptionGuard {
  notifier: Arc<Notifier>,
  id: String,
}

impl SubscriptionGuard {
  /// Stop delivery. Dropping the guard without calling this leaves the
  /// subscription active for the life of the notifier.
  pub fn cancel(self) {
    self.notifier.unsubscribe(&self.id);
  }
}

/// Resets the single-flight flag even when the sync path errors out.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

pub struct SyncOrchestrator {
  upstream: Arc<GuardedUpstream>,
  cache: Arc<TtlCache<CacheValue>>,
  store: Arc<dyn DurableStore>,
  notifier: Arc<Notifier>,
  list_ttl: Duration,
  record_ttl: Duration,
  /// Always bypass the fresh-cache short circuit (explicit config option,
  /// not an environment sniff).
  always_refresh: bool,
  in_flight: AtomicBool,
  metrics: Mutex<SyncMetrics>,
}

impl SyncOrchestrator {
  pub fn new(
    upstream: Arc<GuardedUpstream>,
    cache: Arc<TtlCache<CacheValue>>,
    store: Arc<dyn DurableStore>,
    notifier: Arc<Notifier>,
    list_ttl: Duration,
    record_ttl: Duration,
    always_refresh: bool,
  ) -> Self {
    Self {
      upstream,
      cache,
      store,
      notifier,
      list_ttl,
      record_ttl,
      always_refresh,
      in_flight: AtomicBool::new(false),
      metrics: Mutex::new(SyncMetrics::default()),
    }
  }

  /// Full resync of the mirrored record set.
  ///
  /// Single-flight: a second call while one is running fails fast with
  /// [`SyncError::SyncInProgress`] instead of queueing or duplicating the
  /// upstream fetch.
  pub async fn full_sync(&self) -> Result<SyncOutcome, SyncError> {
    if self.in_flight.swap(true, Ordering::SeqCst) {
      return Err(SyncError::SyncInProgress);
    }
    let _guard = FlightGuard(&self.in_flight);

    let started = Instant::now();
    let result = self.run_sync().await;
    self.record_metrics(result.is_ok(), started.elapsed());
    result
  }

  async fn run_sync(&self) -> Result<SyncOutcome, SyncError> {
    let list_key = CacheKey::RecordsList.render();

    if !self.always_refresh {
      if let Some(CacheValue::RecordList(records)) = self.cache.get(&list_key) {
        debug!(count = records.len(), "full sync served from fresh cache");
        let fetched = records.len();
        return Ok(SyncOutcome {
          records,
          stats: SyncRunStats {
            fetched,
            filtered_out: 0,
            persisted: 0,
            from_cache: true,
            degraded: false,
          },
        });
      }
    }

    let fetched = match self.upstream.list_records().await {
      Ok(records) => records,
      Err(err) => return self.fall_back_to_store(err),
    };

    let fetched_count = fetched.len();
    let records: Vec<ExternalRecord> = fetched.into_iter().filter(|r| r.is_valid()).collect();
    let filtered_out = fetched_count - records.len();
    if filtered_out > 0 {
      debug!(filtered_out, "dropped invalid records from sync result");
    }

    // Persistence is best effort; a dead store degrades, never fails.
    let mut persisted = 0;
    let mut persist_errors = 0;
    for record in &records {
      match self.store.upsert(record) {
        Ok(()) => persisted += 1,
        Err(err) => {
          if persist_errors == 0 {
            warn!(error = %err, "durable store persist failed, continuing with upstream data");
          }
          persist_errors += 1;
        }
      }
    }
    if persist_errors > 0 {
      self.audit(SyncHistoryEntry::new(
        None,
        SyncAction::Error,
        SyncSource::Manual,
        false,
        format!("{} of {} records failed to persist", persist_errors, records.len()),
      ));
    }

    self.cache.set(
      &list_key,
      CacheValue::RecordList(records.clone()),
      self.list_ttl,
    );
    for record in &records {
      let key = CacheKey::Record {
        id: record.external_id.clone(),
      }
      .render();
      self
        .cache
        .set(&key, CacheValue::Record(record.clone()), self.record_ttl);
    }
    self.cache.set(
      &CacheKey::Pipelines.render(),
      CacheValue::Pipelines(derive_pipelines(&records)),
      self.list_ttl,
    );
    self.cache.set(
      &CacheKey::Owners.render(),
      CacheValue::Owners(derive_owners(&records)),
      self.list_ttl,
    );
    self.cache.set(
      &CacheKey::Stats.render(),
      CacheValue::Stats(derive_stats(&records)),
      self.list_ttl,
    );
    // The record set changed; every cached search result is now suspect.
    self.cache.invalidate_by_pattern(CacheKey::search_region());

    self.audit(SyncHistoryEntry::new(
      None,
      SyncAction::Synced,
      SyncSource::Manual,
      true,
      format!("synced {} records", records.len()),
    ));
    self.notifier.emit(SyncEvent::new(
      SyncEventKind::SyncCompleted,
      None,
      format!("synced {} records", records.len()),
    ));

    info!(count = records.len(), persisted, "full sync completed");
    Ok(SyncOutcome {
      records,
      stats: SyncRunStats {
        fetched: fetched_count,
        filtered_out,
        persisted,
        from_cache: false,
        degraded: false,
      },
    })
  }

  /// Upstream failed after a cache miss. The durable store may still hold
  /// a usable (if stale) mirror; with nothing there, the typed error
  /// surfaces so the caller sees an explicit error state rather than a
  /// silently empty list.
  fn fall_back_to_store(&self, err: SyncError) -> Result<SyncOutcome, SyncError> {
    let stored = match self.store.find_many(&RecordFilter::default()) {
      Ok(records) if !records.is_empty() => records,
      _ => {
        self.audit(SyncHistoryEntry::new(
          None,
          SyncAction::Error,
          SyncSource::Manual,
          false,
          err.to_string(),
        ));
        self.notifier.emit(SyncEvent::new(
          SyncEventKind::SyncFailed,
          None,
          err.to_string(),
        ));
        return Err(err);
      }
    };

    warn!(
      error = %err,
      count = stored.len(),
      "upstream unavailable, serving durable store mirror"
    );
    self.audit(SyncHistoryEntry::new(
      None,
      SyncAction::Synced,
      SyncSource::Manual,
      false,
      format!("upstream failed ({}), served {} records from store", err, stored.len()),
    ));

    let fetched = stored.len();
    Ok(SyncOutcome {
      records: stored,
      stats: SyncRunStats {
        fetched,
        filtered_out: 0,
        persisted: 0,
        from_cache: false,
        degraded: true,
      },
    })
  }

  /// Free-text search over the mirrored record set, cached per query.
  ///
  /// Matches title, description, and labels case-insensitively. Results
  /// ride the same freshness rules as the list: any record-set change
  /// invalidates the whole `search` region.
  pub async fn search(&self, query: &str) -> Result<Vec<ExternalRecord>, SyncError> {
    let key = CacheKey::Search {
      query: query.to_string(),
    }
    .render();
    if let Some(CacheValue::RecordList(records)) = self.cache.get(&key) {
      return Ok(records);
    }

    let outcome = self.full_sync().await?;
    let needle = query.trim().to_lowercase();
    let matches: Vec<ExternalRecord> = outcome
      .records
      .into_iter()
      .filter(|r| {
        r.title.to_lowercase().contains(&needle)
          || r
            .description
            .as_deref()
            .map(|d| d.to_lowercase().contains(&needle))
            .unwrap_or(false)
          || r.labels.iter().any(|l| l.to_lowercase() == needle)
      })
      .collect();
    self
      .cache
      .set(&key, CacheValue::RecordList(matches.clone()), self.list_ttl);
    Ok(matches)
  }

  /// Register a subscriber for freshness events. An empty interest set
  /// means "everything".
  pub fn subscribe(
    &self,
    id: impl Into<String>,
    interests: HashSet<SyncEventKind>,
    callback: impl Fn(&SyncEvent) + Send + Sync + 'static,
  ) -> SubscriptionGuard {
    let id = id.into();
    self.notifier.subscribe(id.clone(), interests, callback);
    SubscriptionGuard {
      notifier: Arc::clone(&self.notifier),
      id,
    }
  }

  fn record_metrics(&self, success: bool, duration: Duration) {
    let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
    metrics.total += 1;
    if success {
      metrics.succeeded += 1;
    } else {
      metrics.failed += 1;
    }
    let ms = duration.as_secs_f64() * 1000.0;
    metrics.avg_duration_ms = if metrics.total == 1 {
      ms
    } else {
      metrics.avg_duration_ms * 0.8 + ms * 0.2
    };
    metrics.last_sync_at = Some(Utc::now());
  }

  fn audit(&self, entry: SyncHistoryEntry) {
    if let Err(err) = self.store.append_history(&entry) {
      warn!(error = %err, "failed to append sync history entry");
    }
  }

  // Health/metrics surface: read-only, side-effect-free.

  pub fn cache_stats(&self) -> CacheStats {
    self.cache.stats()
  }

  pub fn circuit_breaker_status(&self) -> CircuitBreakerStatus {
    self.upstream.breaker_status()
  }

  pub fn rate_limiter_status(&self, key: &str) -> RateLimiterStatus {
    self.upstream.limiter_status(key)
  }

  pub fn sync_metrics(&self) -> SyncMetrics {
    self.metrics.lock().expect("metrics lock poisoned").clone()
  }
}

/// Distinct container/status names in first-seen order.
fn derive_pipelines(records: &[ExternalRecord]) -> Vec<String> {
  let mut pipelines = Vec::new();
  for record in records {
    if !record.status_raw.is_empty() && !pipelines.contains(&record.status_raw) {
      pipelines.push(record.status_raw.clone());
    }
  }
  pipelines
}

/// Distinct assignees in first-seen order.
fn derive_owners(records: &[ExternalRecord]) -> Vec<String> {
  let mut owners = Vec::new();
  for record in records {
    for assignee in &record.assignees {
      if !owners.contains(assignee) {
        owners.push(assignee.clone());
      }
    }
  }
  owners
}

fn derive_stats(records: &[ExternalRecord]) -> BoardStats {
  let mut by_status: Vec<(String, usize)> = Vec::new();
  for record in records {
    match by_status.iter_mut().find(|(s, _)| *s == record.status_raw) {
      Some((_, count)) => *count += 1,
      None => by_status.push((record.status_raw.clone(), 1)),
    }
  }
  BoardStats {
    total: records.len(),
    by_status,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::guard::{CircuitBreaker, CircuitState, RateLimiter, RetryPolicy};
  use crate::store::{NoopStore, SqliteStore};
  use crate::upstream::testing::{sample_record, ScriptedUpstream};
  use std::sync::atomic::AtomicU32;
  use std::sync::atomic::Ordering as AtomicOrdering;

  fn orchestrator(
    upstream: Arc<ScriptedUpstream>,
    store: Arc<dyn DurableStore>,
    always_refresh: bool,
  ) -> SyncOrchestrator {
    let guarded = Arc::new(GuardedUpstream::new(
      upstream,
      Arc::new(RateLimiter::new(100, Duration::from_secs(60))),
      Arc::new(CircuitBreaker::new(5, Duration::from_secs(30))),
      RetryPolicy::new(vec![]),
    ));
    SyncOrchestrator::new(
      guarded,
      Arc::new(TtlCache::new(50)),
      store,
      Arc::new(Notifier::new()),
      Duration::from_secs(300),
      Duration::from_secs(300),
      always_refresh,
    )
  }

  fn three_records() -> Vec<ExternalRecord> {
    vec![
      sample_record("crd-1", "Fix login flow", "Open"),
      sample_record("crd-2", "Renew certificates", "Open"),
      sample_record("crd-3", "Ship release notes", "Done"),
    ]
  }

  #[tokio::test]
  async fn test_sync_populates_cache_then_serves_from_it() {
    let upstream = Arc::new(ScriptedUpstream::new(three_records()));
    let orch = orchestrator(upstream.clone(), Arc::new(NoopStore), false);

    let first = orch.full_sync().await.unwrap();
    assert_eq!(first.records.len(), 3);
    assert!(!first.stats.from_cache);
    assert_eq!(upstream.list_calls.load(AtomicOrdering::SeqCst), 1);

    // records:list plus three per-record entries plus pipelines.
    assert!(orch.cache.get(&CacheKey::RecordsList.render()).is_some());
    for id in ["crd-1", "crd-2", "crd-3"] {
      assert!(orch
        .cache
        .get(&CacheKey::Record { id: id.into() }.render())
        .is_some());
    }

    // Within the TTL the second sync never touches the network.
    let second = orch.full_sync().await.unwrap();
    assert_eq!(second.records.len(), 3);
    assert!(second.stats.from_cache);
    assert_eq!(upstream.list_calls.load(AtomicOrdering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_single_flight_rejects_concurrent_sync() {
    let upstream = Arc::new(ScriptedUpstream::new(three_records()));
    upstream.delay_ms.store(50, AtomicOrdering::SeqCst);
    let orch = Arc::new(orchestrator(upstream.clone(), Arc::new(NoopStore), false));

    let orch_a = orch.clone();
    let orch_b = orch.clone();
    let (a, b) = tokio::join!(
      tokio::spawn(async move { orch_a.full_sync().await }),
      tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        orch_b.full_sync().await
      }),
    );

    let a = a.unwrap();
    let b = b.unwrap();
    assert!(a.is_ok());
    assert!(matches!(b, Err(SyncError::SyncInProgress)));
    // Exactly one upstream fetch.
    assert_eq!(upstream.list_calls.load(AtomicOrdering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_invalid_records_filtered() {
    let mut records = three_records();
    records.push(sample_record("crd-4", "   ", "Open"));
    records.push(sample_record("crd-5", "Template: bug report", "Open"));
    let upstream = Arc::new(ScriptedUpstream::new(records));
    let orch = orchestrator(upstream, Arc::new(NoopStore), false);

    let outcome = orch.full_sync().await.unwrap();
    assert_eq!(outcome.records.len(), 3);
    assert_eq!(outcome.stats.fetched, 5);
    assert_eq!(outcome.stats.filtered_out, 2);
  }

  #[tokio::test]
  async fn test_persists_into_durable_store() {
    let upstream = Arc::new(ScriptedUpstream::new(three_records()));
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let orch = orchestrator(upstream, store.clone(), false);

    let outcome = orch.full_sync().await.unwrap();
    assert_eq!(outcome.stats.persisted, 3);
    assert!(store.find_by_id("crd-2").unwrap().is_some());

    let history = store.recent_history(10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action, SyncAction::Synced);
    assert!(history[0].success);
  }

  struct FailingStore;

  impl DurableStore for FailingStore {
    fn upsert(&self, _record: &ExternalRecord) -> Result<(), SyncError> {
      Err(SyncError::DurableStore("disk full".into()))
    }
    fn find_by_id(&self, _id: &str) -> Result<Option<ExternalRecord>, SyncError> {
      Err(SyncError::DurableStore("disk full".into()))
    }
    fn find_many(&self, _filter: &RecordFilter) -> Result<Vec<ExternalRecord>, SyncError> {
      Err(SyncError::DurableStore("disk full".into()))
    }
    fn delete(&self, _id: &str) -> Result<bool, SyncError> {
      Err(SyncError::DurableStore("disk full".into()))
    }
    fn append_history(&self, _entry: &SyncHistoryEntry) -> Result<(), SyncError> {
      Err(SyncError::DurableStore("disk full".into()))
    }
    fn recent_history(&self, _limit: usize) -> Result<Vec<SyncHistoryEntry>, SyncError> {
      Ok(Vec::new())
    }
    fn prune_history(&self, _older_than: chrono::Duration) -> Result<usize, SyncError> {
      Ok(0)
    }
  }

  #[tokio::test]
  async fn test_store_failure_degrades_gracefully() {
    let upstream = Arc::new(ScriptedUpstream::new(three_records()));
    let orch = orchestrator(upstream, Arc::new(FailingStore), false);

    // Persist failures never surface from the happy path.
    let outcome = orch.full_sync().await.unwrap();
    assert_eq!(outcome.records.len(), 3);
    assert_eq!(outcome.stats.persisted, 0);
  }

  #[tokio::test]
  async fn test_upstream_failure_with_empty_store_surfaces_error() {
    let upstream = Arc::new(ScriptedUpstream::new(vec![]));
    upstream.fail_next(1);
    let orch = orchestrator(upstream, Arc::new(NoopStore), false);

    let err = orch.full_sync().await.unwrap_err();
    assert!(matches!(err, SyncError::UpstreamServer { .. }));

    let metrics = orch.sync_metrics();
    assert_eq!(metrics.total, 1);
    assert_eq!(metrics.failed, 1);
  }

  #[tokio::test]
  async fn test_upstream_failure_falls_back_to_store_mirror() {
    let upstream = Arc::new(ScriptedUpstream::new(vec![]));
    upstream.fail_next(1);
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    store.upsert(&sample_record("crd-1", "Fix login flow", "Open")).unwrap();
    let orch = orchestrator(upstream, store, false);

    let outcome = orch.full_sync().await.unwrap();
    assert!(outcome.stats.degraded);
    assert_eq!(outcome.records.len(), 1);
  }

  #[tokio::test]
  async fn test_always_refresh_bypasses_fresh_cache() {
    let upstream = Arc::new(ScriptedUpstream::new(three_records()));
    let orch = orchestrator(upstream.clone(), Arc::new(NoopStore), true);

    orch.full_sync().await.unwrap();
    orch.full_sync().await.unwrap();
    assert_eq!(upstream.list_calls.load(AtomicOrdering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_subscribers_filtered_by_interest_and_cancelable() {
    let upstream = Arc::new(ScriptedUpstream::new(three_records()));
    let orch = orchestrator(upstream, Arc::new(NoopStore), true);

    let completed = Arc::new(AtomicU32::new(0));
    let completed_clone = completed.clone();
    let guard = orch.subscribe(
      "ui",
      HashSet::from([SyncEventKind::SyncCompleted]),
      move |_| {
        completed_clone.fetch_add(1, AtomicOrdering::SeqCst);
      },
    );

    orch.full_sync().await.unwrap();
    assert_eq!(completed.load(AtomicOrdering::SeqCst), 1);

    guard.cancel();
    orch.full_sync().await.unwrap();
    assert_eq!(completed.load(AtomicOrdering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_metrics_track_success_and_duration() {
    let upstream = Arc::new(ScriptedUpstream::new(three_records()));
    let orch = orchestrator(upstream, Arc::new(NoopStore), false);

    orch.full_sync().await.unwrap();
    orch.full_sync().await.unwrap();

    let metrics = orch.sync_metrics();
    assert_eq!(metrics.total, 2);
    assert_eq!(metrics.succeeded, 2);
    assert_eq!(metrics.failed, 0);
    assert!(metrics.last_sync_at.is_some());
    assert!(metrics.avg_duration_ms >= 0.0);
  }

  #[tokio::test]
  async fn test_breaker_status_visible_through_health_surface() {
    let upstream = Arc::new(ScriptedUpstream::new(vec![]));
    let orch = orchestrator(upstream, Arc::new(NoopStore), false);
    assert_eq!(orch.circuit_breaker_status().state, CircuitState::Closed);
    assert_eq!(orch.rate_limiter_status("records").in_window, 0);
  }

  #[tokio::test]
  async fn test_sync_caches_owners_and_stats() {
    let mut records = three_records();
    records[0].assignees = vec!["dana".into(), "lee".into()];
    records[1].assignees = vec!["dana".into()];
    let upstream = Arc::new(ScriptedUpstream::new(records));
    let orch = orchestrator(upstream, Arc::new(NoopStore), false);

    orch.full_sync().await.unwrap();

    match orch.cache.get(&CacheKey::Owners.render()) {
      Some(CacheValue::Owners(owners)) => assert_eq!(owners, vec!["dana", "lee"]),
      other => panic!("expected owners entry, got {:?}", other),
    }
    match orch.cache.get(&CacheKey::Stats.render()) {
      Some(CacheValue::Stats(stats)) => {
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_status, vec![("Open".to_string(), 2), ("Done".to_string(), 1)]);
      }
      other => panic!("expected stats entry, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_search_is_cached_per_query() {
    let upstream = Arc::new(ScriptedUpstream::new(three_records()));
    let orch = orchestrator(upstream.clone(), Arc::new(NoopStore), false);

    let first = orch.search("login").await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].external_id, "crd-1");

    // Second identical query is a pure cache hit.
    let second = orch.search("  LOGIN ").await.unwrap();
    assert_eq!(second, first);
    assert_eq!(upstream.list_calls.load(AtomicOrdering::SeqCst), 1);

    let miss = orch.search("no such text").await.unwrap();
    assert!(miss.is_empty());
  }

  #[tokio::test]
  async fn test_full_sync_invalidates_cached_searches() {
    let upstream = Arc::new(ScriptedUpstream::new(three_records()));
    let orch = orchestrator(upstream, Arc::new(NoopStore), true);

    orch.search("login").await.unwrap();
    let key = CacheKey::Search { query: "login".into() }.render();
    assert!(orch.cache.get(&key).is_some());

    orch.full_sync().await.unwrap();
    assert!(orch.cache.get(&key).is_none());
  }

  #[test]
  fn test_derive_pipelines_orders_by_first_seen() {
    let records = vec![
      sample_record("crd-1", "A", "Open"),
      sample_record("crd-2", "B", "Done"),
      sample_record("crd-3", "C", "Open"),
    ];
    assert_eq!(derive_pipelines(&records), vec!["Open", "Done"]);
  }
}
