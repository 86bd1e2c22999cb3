//! The upstream board/CRM service, modelled as an opaque trait over three
//! calls: list everything, list changes since a timestamp, fetch one record.

pub mod client;
pub mod guarded;
pub mod types;

pub use client::HttpUpstream;
pub use guarded::GuardedUpstream;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::error::SyncError;
use types::{ChangeAction, ExternalRecord};

/// Capability surface of the authoritative upstream service.
///
/// Implementations must not cache: freshness decisions belong to the
/// `TtlCache`, and every call here is assumed to hit the network.
pub trait Upstream: Send + Sync {
  /// All current records for the monitored board, with pagination already
  /// resolved.
  fn list_records(&self) -> BoxFuture<'_, Result<Vec<ExternalRecord>, SyncError>>;

  /// Change-action descriptors newer than `since`.
  fn changes_since(
    &self,
    since: DateTime<Utc>,
  ) -> BoxFuture<'_, Result<Vec<ChangeAction>, SyncError>>;

  /// One record by upstream id.
  fn get_record<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<ExternalRecord, SyncError>>;
}
