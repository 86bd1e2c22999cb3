//! Domain types mirrored from upstream, plus the wire shapes they are
//! parsed from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One unit of work (card or ticket) owned by upstream and mirrored
/// locally, keyed by `external_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRecord {
  pub external_id: String,
  pub title: String,
  pub description: Option<String>,
  /// Upstream's raw status/container name; local status derivation maps it.
  pub status_raw: String,
  pub labels: Vec<String>,
  pub assignees: Vec<String>,
  pub due_date: Option<DateTime<Utc>>,
  pub last_modified: DateTime<Utc>,
}

impl ExternalRecord {
  /// Records with empty or template titles are artifacts of board setup,
  /// not real work items.
  pub fn is_valid(&self) -> bool {
    let title = self.title.trim();
    !title.is_empty() && !title.to_lowercase().starts_with("template")
  }
}

/// A change-action descriptor from the upstream "changes since T" call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeAction {
  pub kind: String,
  pub record_id: Option<String>,
  pub at: DateTime<Utc>,
}

/// Aggregate board statistics cached under the `stats` region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardStats {
  pub total: usize,
  /// Record counts per raw status, in first-seen order.
  pub by_status: Vec<(String, usize)>,
}

/// Closed set of shapes the cache holds, so one `TtlCache` instance serves
/// every region while staying strongly typed.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
  RecordList(Vec<ExternalRecord>),
  Record(ExternalRecord),
  /// Distinct container/status names derived from the record set.
  Pipelines(Vec<String>),
  /// Distinct assignees across the record set.
  Owners(Vec<String>),
  Stats(BoardStats),
}

impl CacheValue {
  pub fn as_record(&self) -> Option<&ExternalRecord> {
    match self {
      CacheValue::Record(record) => Some(record),
      _ => None,
    }
  }
}

// ============================================================================
// Wire shapes
// ============================================================================

/// One page of the upstream "list records" response.
#[derive(Debug, Deserialize)]
pub struct ApiRecordPage {
  pub records: Vec<ApiRecord>,
  /// Continuation cursor; absent on the last page.
  #[serde(default)]
  pub cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiRecord {
  pub id: String,
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub desc: Option<String>,
  #[serde(default)]
  pub status: String,
  #[serde(default)]
  pub labels: Vec<String>,
  #[serde(default)]
  pub members: Vec<String>,
  #[serde(default)]
  pub due: Option<DateTime<Utc>>,
  #[serde(rename = "dateLastActivity", default)]
  pub last_activity: Option<DateTime<Utc>>,
}

impl ApiRecord {
  pub fn into_record(self) -> ExternalRecord {
    ExternalRecord {
      external_id: self.id,
      title: self.name,
      description: self.desc,
      status_raw: self.status,
      labels: self.labels,
      assignees: self.members,
      due_date: self.due,
      last_modified: self.last_activity.unwrap_or_else(Utc::now),
    }
  }
}

/// One descriptor from the upstream "actions since" response.
#[derive(Debug, Deserialize)]
pub struct ApiChange {
  #[serde(rename = "type")]
  pub kind: String,
  #[serde(rename = "date")]
  pub at: DateTime<Utc>,
  #[serde(rename = "recordId", default)]
  pub record_id: Option<String>,
}

impl ApiChange {
  pub fn into_change(self) -> ChangeAction {
    ChangeAction {
      kind: self.kind,
      record_id: self.record_id,
      at: self.at,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record(title: &str) -> ExternalRecord {
    ExternalRecord {
      external_id: "crd-1".into(),
      title: title.into(),
      description: None,
      status_raw: "Open".into(),
      labels: vec![],
      assignees: vec![],
      due_date: None,
      last_modified: Utc::now(),
    }
  }

  #[test]
  fn test_record_validity() {
    assert!(record("Fix login flow").is_valid());
    assert!(!record("").is_valid());
    assert!(!record("   ").is_valid());
    assert!(!record("Template: bug report").is_valid());
    assert!(!record("TEMPLATE card").is_valid());
  }

  #[test]
  fn test_api_record_maps_fields() {
    let api: ApiRecord = serde_json::from_value(serde_json::json!({
      "id": "crd-9",
      "name": "Renew certificates",
      "status": "In Progress",
      "labels": ["ops"],
      "members": ["dana"],
      "dateLastActivity": "2026-08-20T10:00:00Z"
    }))
    .unwrap();

    let record = api.into_record();
    assert_eq!(record.external_id, "crd-9");
    assert_eq!(record.title, "Renew certificates");
    assert_eq!(record.status_raw, "In Progress");
    assert_eq!(record.assignees, vec!["dana".to_string()]);
    assert!(record.due_date.is_none());
  }

  #[test]
  fn test_api_change_maps_fields() {
    let api: ApiChange = serde_json::from_value(serde_json::json!({
      "type": "updateCard",
      "date": "2026-08-20T10:00:00Z",
      "recordId": "crd-9"
    }))
    .unwrap();

    let change = api.into_change();
    assert_eq!(change.kind, "updateCard");
    assert_eq!(change.record_id.as_deref(), Some("crd-9"));
  }
}
