//! Optional durable store behind the cache.
//!
//! The orchestrator depends only on the `DurableStore` trait; a process
//! without usable persistence runs on `NoopStore` with identical behavior
//! minus durability. Store failures are recovered locally and never
//! propagate out of the sync happy path.

mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::upstream::types::ExternalRecord;

/// What a mutation path did, for the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncAction {
  Created,
  Updated,
  Deleted,
  Synced,
  Error,
}

impl SyncAction {
  pub fn as_str(&self) -> &'static str {
    match self {
      SyncAction::Created => "created",
      SyncAction::Updated => "updated",
      SyncAction::Deleted => "deleted",
      SyncAction::Synced => "synced",
      SyncAction::Error => "error",
    }
  }
}

/// Which path produced a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncSource {
  Poll,
  Webhook,
  Manual,
}

impl SyncSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      SyncSource::Poll => "poll",
      SyncSource::Webhook => "webhook",
      SyncSource::Manual => "manual",
    }
  }
}

/// Append-only audit record written by every mutation path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncHistoryEntry {
  pub record_id: Option<String>,
  pub action: SyncAction,
  pub source: SyncSource,
  pub success: bool,
  pub detail: String,
  pub at: DateTime<Utc>,
}

impl SyncHistoryEntry {
  pub fn new(
    record_id: Option<String>,
    action: SyncAction,
    source: SyncSource,
    success: bool,
    detail: impl Into<String>,
  ) -> Self {
    Self {
      record_id,
      action,
      source,
      success,
      detail: detail.into(),
      at: Utc::now(),
    }
  }
}

/// Filter for `find_many`. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
  pub status: Option<String>,
  pub assignee: Option<String>,
}

/// Durable persistence for mirrored records and the sync audit trail.
pub trait DurableStore: Send + Sync {
  fn upsert(&self, record: &ExternalRecord) -> Result<(), SyncError>;
  fn find_by_id(&self, id: &str) -> Result<Option<ExternalRecord>, SyncError>;
  fn find_many(&self, filter: &RecordFilter) -> Result<Vec<ExternalRecord>, SyncError>;
  fn delete(&self, id: &str) -> Result<bool, SyncError>;

  fn append_history(&self, entry: &SyncHistoryEntry) -> Result<(), SyncError>;
  fn recent_history(&self, limit: usize) -> Result<Vec<SyncHistoryEntry>, SyncError>;
  /// Rolling cleanup: delete history older than the given age. Returns the
  /// number of rows removed.
  fn prune_history(&self, older_than: chrono::Duration) -> Result<usize, SyncError>;
}

/// Store used when persistence is disabled or unavailable.
/// All operations are no-ops; reads always come back empty.
pub struct NoopStore;

impl DurableStore for NoopStore {
  fn upsert(&self, _record: &ExternalRecord) -> Result<(), SyncError> {
    Ok(())
  }

  fn find_by_id(&self, _id: &str) -> Result<Option<ExternalRecord>, SyncError> {
    Ok(None)
  }

  fn find_many(&self, _filter: &RecordFilter) -> Result<Vec<ExternalRecord>, SyncError> {
    Ok(Vec::new())
  }

  fn delete(&self, _id: &str) -> Result<bool, SyncError> {
    Ok(false)
  }

  fn append_history(&self, _entry: &SyncHistoryEntry) -> Result<(), SyncError> {
    Ok(())
  }

  fn recent_history(&self, _limit: usize) -> Result<Vec<SyncHistoryEntry>, SyncError> {
    Ok(Vec::new())
  }

  fn prune_history(&self, _older_than: chrono::Duration) -> Result<usize, SyncError> {
    Ok(0)
  }
}
