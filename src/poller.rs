//! Periodic "what changed since last check" puller.
//!
//! Polling is the pull-side counterpart of the webhook path: both funnel
//! change signals into the same cache invalidation and notification flow.
//! A failed probe is swallowed for that tick and retried on the next one;
//! the loop never queues overdue ticks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, TtlCache};
use crate::notify::{Notifier, SyncEvent, SyncEventKind};
use crate::store::{DurableStore, SyncAction, SyncHistoryEntry, SyncSource};
use crate::upstream::types::{CacheValue, ChangeAction};
use crate::upstream::GuardedUpstream;

type OnChange = Arc<dyn Fn(&[ChangeAction]) + Send + Sync>;

/// Periodic change poller feeding the shared invalidation path.
pub struct PollingScheduler {
  upstream: Arc<GuardedUpstream>,
  cache: Arc<TtlCache<CacheValue>>,
  store: Arc<dyn DurableStore>,
  notifier: Arc<Notifier>,
  list_ttl: Duration,
  stopped: Arc<AtomicBool>,
  cancel: Arc<Notify>,
  handle: Mutex<Option<JoinHandle<()>>>,
}

impl PollingScheduler {
  pub fn new(
    upstream: Arc<GuardedUpstream>,
    cache: Arc<TtlCache<CacheValue>>,
    store: Arc<dyn DurableStore>,
    notifier: Arc<Notifier>,
    list_ttl: Duration,
  ) -> Self {
    Self {
      upstream,
      cache,
      store,
      notifier,
      list_ttl,
      stopped: Arc::new(AtomicBool::new(false)),
      cancel: Arc::new(Notify::new()),
      handle: Mutex::new(None),
    }
  }

  /// Start polling. Each tick probes for changes since the previous tick;
  /// a non-empty change list triggers a full refetch, a list-cache
  /// refresh, and `on_change`. Calling `start` on a running scheduler is
  /// a no-op.
  pub fn start(&self, interval: Duration, on_change: impl Fn(&[ChangeAction]) + Send + Sync + 'static) {
    let mut handle_slot = self.handle.lock().expect("poller lock poisoned");
    if handle_slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
      warn!("polling scheduler already running, ignoring start");
      return;
    }

    self.stopped.store(false, Ordering::SeqCst);

    let upstream = Arc::clone(&self.upstream);
    let cache = Arc::clone(&self.cache);
    let store = Arc::clone(&self.store);
    let notifier = Arc::clone(&self.notifier);
    let list_ttl = self.list_ttl;
    let stopped = Arc::clone(&self.stopped);
    let cancel = Arc::clone(&self.cancel);
    let on_change: OnChange = Arc::new(on_change);

    info!(interval_secs = interval.as_secs(), "polling scheduler started");
    *handle_slot = Some(tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      // Overdue ticks are skipped, never queued; the loop body is
      // sequential so at most one tick is ever in flight.
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
      ticker.tick().await;

      let mut since = Utc::now();
      loop {
        tokio::select! {
          _ = ticker.tick() => {}
          _ = cancel.notified() => break,
        }
        if stopped.load(Ordering::SeqCst) {
          break;
        }

        match Self::run_tick(&upstream, &cache, &store, &notifier, &stopped, list_ttl, since).await
        {
          Ok(Some((changes, advanced))) => {
            since = advanced;
            on_change(&changes);
          }
          Ok(None) => {}
          Err(err) => {
            // Swallow the failure for this tick; the next tick retries.
            warn!(error = %err, "poll tick failed, will retry on next tick");
          }
        }
      }
      debug!("polling loop exited");
    }));
  }

  /// One probe + refresh cycle. Returns the applied changes and the new
  /// "since" watermark, or `None` when nothing changed or the scheduler
  /// was stopped mid-flight (results discarded).
  async fn run_tick(
    upstream: &GuardedUpstream,
    cache: &TtlCache<CacheValue>,
    store: &Arc<dyn DurableStore>,
    notifier: &Notifier,
    stopped: &AtomicBool,
    list_ttl: Duration,
    since: DateTime<Utc>,
  ) -> Result<Option<(Vec<ChangeAction>, DateTime<Utc>)>, crate::error::SyncError> {
    let changes = upstream.changes_since(since).await?;
    if stopped.load(Ordering::SeqCst) {
      return Ok(None);
    }
    if changes.is_empty() {
      return Ok(None);
    }

    debug!(count = changes.len(), "upstream reported changes, refetching");
    let records = upstream.list_records().await?;
    if stopped.load(Ordering::SeqCst) {
      return Ok(None);
    }

    let list_key = CacheKey::RecordsList.render();
    cache.delete(&list_key);
    cache.set(&list_key, CacheValue::RecordList(records.clone()), list_ttl);
    // The record set changed: every region derived from it is stale now.
    cache.invalidate_by_pattern(CacheKey::record_region());
    cache.delete(&CacheKey::Pipelines.render());
    cache.delete(&CacheKey::Owners.render());
    cache.delete(&CacheKey::Stats.render());
    cache.invalidate_by_pattern(CacheKey::search_region());

    let advanced = changes.iter().map(|c| c.at).max().unwrap_or_else(Utc::now);

    if let Err(err) = store.append_history(&SyncHistoryEntry::new(
      None,
      SyncAction::Synced,
      SyncSource::Poll,
      true,
      format!("poll applied {} changes, {} records", changes.len(), records.len()),
    )) {
      warn!(error = %err, "failed to append sync history entry");
    }

    notifier.emit(SyncEvent::new(
      SyncEventKind::RecordsRefreshed,
      None,
      format!("poll refreshed {} records", records.len()),
    ));

    Ok(Some((changes, advanced)))
  }

  /// Cancel the timer immediately. An in-flight tick is allowed to finish
  /// its upstream call, but its results are discarded.
  pub fn stop(&self) {
    self.stopped.store(true, Ordering::SeqCst);
    self.cancel.notify_waiters();
    info!("polling scheduler stopped");
  }

  pub fn is_running(&self) -> bool {
    let handle = self.handle.lock().expect("poller lock poisoned");
    handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
  }
}
