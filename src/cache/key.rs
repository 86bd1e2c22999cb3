//! Structured cache keys.
//!
//! Keys render to `region:identifier[:variant-hash]` strings so they work
//! both for direct lookup and for prefix invalidation of a whole region.

use sha2::{Digest, Sha256};

/// Cache key for a region of mirrored data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheKey {
  /// The full mirrored record set.
  RecordsList,
  /// A single record by upstream id.
  Record { id: String },
  /// Container/status metadata derived from the board.
  Pipelines,
  /// Known record owners/assignees.
  Owners,
  /// Aggregate dashboard statistics.
  Stats,
  /// A saved search result, keyed by a hash of the query.
  Search { query: String },
}

impl CacheKey {
  /// Render the key to its canonical string form.
  pub fn render(&self) -> String {
    match self {
      Self::RecordsList => "records:list".to_string(),
      Self::Record { id } => format!("record:{}", id),
      Self::Pipelines => "pipelines".to_string(),
      Self::Owners => "owners".to_string(),
      Self::Stats => "stats".to_string(),
      Self::Search { query } => format!("search:{}", hash_query(query)),
    }
  }

  /// Prefix pattern matching every single-record entry.
  pub fn record_region() -> &'static str {
    "record:*"
  }

  /// Prefix pattern matching every cached search result.
  pub fn search_region() -> &'static str {
    "search:*"
  }
}

/// Normalize and hash a search query for a stable, fixed-length key.
/// Trims whitespace and lowercases for case-insensitive matching.
fn hash_query(query: &str) -> String {
  let normalized = query.trim().to_lowercase();
  let mut hasher = Sha256::new();
  hasher.update(normalized.as_bytes());
  hex::encode(hasher.finalize())
}
