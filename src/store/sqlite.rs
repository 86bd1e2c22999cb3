//! SQLite-backed durable store.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::SyncError;
use crate::upstream::types::ExternalRecord;

use super::{DurableStore, RecordFilter, SyncAction, SyncHistoryEntry, SyncSource};

/// Schema for the mirror tables. Records are stored as serialized JSON
/// alongside the columns we filter on.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    external_id TEXT PRIMARY KEY,
    status_raw TEXT NOT NULL,
    data BLOB NOT NULL,
    last_modified TEXT NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_records_status ON records(status_raw);

CREATE TABLE IF NOT EXISTS sync_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id TEXT,
    action TEXT NOT NULL,
    source TEXT NOT NULL,
    success INTEGER NOT NULL,
    detail TEXT NOT NULL,
    at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_history_at ON sync_history(at);
"#;

/// Durable store backed by a single SQLite database.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open or create the database at the default location.
  pub fn open() -> Result<Self, SyncError> {
    let path = Self::default_path()?;

    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| SyncError::DurableStore(format!("failed to create data directory: {}", e)))?;
    }

    let conn = Connection::open(&path).map_err(|e| {
      SyncError::DurableStore(format!("failed to open database at {}: {}", path.display(), e))
    })?;

    Self::from_connection(conn)
  }

  /// In-memory database, used by tests.
  pub fn in_memory() -> Result<Self, SyncError> {
    let conn = Connection::open_in_memory()
      .map_err(|e| SyncError::DurableStore(format!("failed to open in-memory database: {}", e)))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self, SyncError> {
    conn
      .execute_batch(SCHEMA)
      .map_err(|e| SyncError::DurableStore(format!("failed to run migrations: {}", e)))?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn default_path() -> Result<PathBuf, SyncError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| SyncError::DurableStore("could not determine data directory".into()))?;
    Ok(data_dir.join("boardsync").join("mirror.db"))
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, SyncError> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::DurableStore(format!("lock poisoned: {}", e)))
  }
}

fn decode_record(data: &[u8]) -> Result<ExternalRecord, SyncError> {
  serde_json::from_slice(data)
    .map_err(|e| SyncError::DurableStore(format!("failed to deserialize record: {}", e)))
}

fn parse_action(s: &str) -> SyncAction {
  match s {
    "created" => SyncAction::Created,
    "updated" => SyncAction::Updated,
    "deleted" => SyncAction::Deleted,
    "synced" => SyncAction::Synced,
    _ => SyncAction::Error,
  }
}

fn parse_source(s: &str) -> SyncSource {
  match s {
    "poll" => SyncSource::Poll,
    "webhook" => SyncSource::Webhook,
    _ => SyncSource::Manual,
  }
}

impl DurableStore for SqliteStore {
  fn upsert(&self, record: &ExternalRecord) -> Result<(), SyncError> {
    let conn = self.lock()?;
    let data = serde_json::to_vec(record)
      .map_err(|e| SyncError::DurableStore(format!("failed to serialize record: {}", e)))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO records (external_id, status_raw, data, last_modified, stored_at)
         VALUES (?, ?, ?, ?, datetime('now'))",
        params![
          record.external_id,
          record.status_raw,
          data,
          record.last_modified.to_rfc3339()
        ],
      )
      .map_err(|e| SyncError::DurableStore(format!("failed to upsert record: {}", e)))?;

    Ok(())
  }

  fn find_by_id(&self, id: &str) -> Result<Option<ExternalRecord>, SyncError> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT data FROM records WHERE external_id = ?")
      .map_err(|e| SyncError::DurableStore(format!("failed to prepare query: {}", e)))?;

    let data: Option<Vec<u8>> = stmt.query_row(params![id], |row| row.get(0)).ok();
    match data {
      Some(data) => Ok(Some(decode_record(&data)?)),
      None => Ok(None),
    }
  }

  fn find_many(&self, filter: &RecordFilter) -> Result<Vec<ExternalRecord>, SyncError> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT data FROM records ORDER BY last_modified DESC")
      .map_err(|e| SyncError::DurableStore(format!("failed to prepare query: {}", e)))?;

    let blobs: Vec<Vec<u8>> = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| SyncError::DurableStore(format!("failed to query records: {}", e)))?
      .filter_map(|r| r.ok())
      .collect();

    let mut records = Vec::with_capacity(blobs.len());
    for data in blobs {
      let record = decode_record(&data)?;
      if let Some(ref status) = filter.status {
        if !record.status_raw.eq_ignore_ascii_case(status) {
          continue;
        }
      }
      if let Some(ref assignee) = filter.assignee {
        if !record.assignees.iter().any(|a| a.eq_ignore_ascii_case(assignee)) {
          continue;
        }
      }
      records.push(record);
    }

    Ok(records)
  }

  fn delete(&self, id: &str) -> Result<bool, SyncError> {
    let conn = self.lock()?;
    let removed = conn
      .execute("DELETE FROM records WHERE external_id = ?", params![id])
      .map_err(|e| SyncError::DurableStore(format!("failed to delete record: {}", e)))?;
    Ok(removed > 0)
  }

  fn append_history(&self, entry: &SyncHistoryEntry) -> Result<(), SyncError> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT INTO sync_history (record_id, action, source, success, detail, at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          entry.record_id,
          entry.action.as_str(),
          entry.source.as_str(),
          entry.success as i64,
          entry.detail,
          entry.at.to_rfc3339()
        ],
      )
      .map_err(|e| SyncError::DurableStore(format!("failed to append history: {}", e)))?;
    Ok(())
  }

  fn recent_history(&self, limit: usize) -> Result<Vec<SyncHistoryEntry>, SyncError> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT record_id, action, source, success, detail, at
         FROM sync_history ORDER BY id DESC LIMIT ?",
      )
      .map_err(|e| SyncError::DurableStore(format!("failed to prepare query: {}", e)))?;

    let entries = stmt
      .query_map(params![limit as i64], |row| {
        let action: String = row.get(1)?;
        let source: String = row.get(2)?;
        let success: i64 = row.get(3)?;
        let at: String = row.get(5)?;
        Ok(SyncHistoryEntry {
          record_id: row.get(0)?,
          action: parse_action(&action),
          source: parse_source(&source),
          success: success != 0,
          detail: row.get(4)?,
          at: DateTime::parse_from_rfc3339(&at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        })
      })
      .map_err(|e| SyncError::DurableStore(format!("failed to query history: {}", e)))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(entries)
  }

  fn prune_history(&self, older_than: chrono::Duration) -> Result<usize, SyncError> {
    let cutoff = Utc::now() - older_than;
    let conn = self.lock()?;
    let removed = conn
      .execute("DELETE FROM sync_history WHERE at < ?", params![cutoff.to_rfc3339()])
      .map_err(|e| SyncError::DurableStore(format!("failed to prune history: {}", e)))?;
    Ok(removed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::upstream::testing::sample_record;

  #[test]
  fn test_upsert_and_find_by_id() {
    let store = SqliteStore::in_memory().unwrap();
    let record = sample_record("crd-1", "Fix login flow", "Open");

    store.upsert(&record).unwrap();
    let found = store.find_by_id("crd-1").unwrap().unwrap();
    assert_eq!(found.title, "Fix login flow");

    // Upsert with the same id replaces.
    let mut updated = record.clone();
    updated.title = "Fix login flow (retry)".into();
    store.upsert(&updated).unwrap();
    let found = store.find_by_id("crd-1").unwrap().unwrap();
    assert_eq!(found.title, "Fix login flow (retry)");
  }

  #[test]
  fn test_find_many_with_filter() {
    let store = SqliteStore::in_memory().unwrap();
    let mut a = sample_record("crd-1", "A", "Open");
    a.assignees = vec!["dana".into()];
    let b = sample_record("crd-2", "B", "Done");
    store.upsert(&a).unwrap();
    store.upsert(&b).unwrap();

    assert_eq!(store.find_many(&RecordFilter::default()).unwrap().len(), 2);

    let open = store
      .find_many(&RecordFilter {
        status: Some("open".into()),
        ..Default::default()
      })
      .unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].external_id, "crd-1");

    let danas = store
      .find_many(&RecordFilter {
        assignee: Some("Dana".into()),
        ..Default::default()
      })
      .unwrap();
    assert_eq!(danas.len(), 1);
  }

  #[test]
  fn test_delete() {
    let store = SqliteStore::in_memory().unwrap();
    store.upsert(&sample_record("crd-1", "A", "Open")).unwrap();

    assert!(store.delete("crd-1").unwrap());
    assert!(!store.delete("crd-1").unwrap());
    assert!(store.find_by_id("crd-1").unwrap().is_none());
  }

  #[test]
  fn test_history_append_and_recent() {
    let store = SqliteStore::in_memory().unwrap();
    store
      .append_history(&SyncHistoryEntry::new(
        Some("crd-1".into()),
        SyncAction::Updated,
        SyncSource::Webhook,
        true,
        "refetched after updateCard",
      ))
      .unwrap();
    store
      .append_history(&SyncHistoryEntry::new(
        None,
        SyncAction::Synced,
        SyncSource::Manual,
        true,
        "synced 3 records",
      ))
      .unwrap();

    let recent = store.recent_history(10).unwrap();
    assert_eq!(recent.len(), 2);
    // Newest first.
    assert_eq!(recent[0].action, SyncAction::Synced);
    assert_eq!(recent[1].source, SyncSource::Webhook);
  }

  #[test]
  fn test_prune_history_is_age_based() {
    let store = SqliteStore::in_memory().unwrap();
    let mut old = SyncHistoryEntry::new(None, SyncAction::Synced, SyncSource::Poll, true, "old");
    old.at = Utc::now() - chrono::Duration::days(40);
    store.append_history(&old).unwrap();
    store
      .append_history(&SyncHistoryEntry::new(
        None,
        SyncAction::Synced,
        SyncSource::Poll,
        true,
        "fresh",
      ))
      .unwrap();

    let removed = store.prune_history(chrono::Duration::days(30)).unwrap();
    assert_eq!(removed, 1);
    let recent = store.recent_history(10).unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].detail, "fresh");
  }
}
