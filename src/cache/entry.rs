//! Snapshots of cache entries as seen by consumers.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::key::ResourceKey;
use crate::error::FetchError;

/// Lifecycle status of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
  /// Nothing has been requested yet (or the entry was removed)
  Idle,
  /// The first fetch is in progress and there is no data yet
  Loading,
  /// The last completed fetch or write succeeded
  Success,
  /// The last completed fetch failed; `data` may still hold the last good value
  Error,
}

/// A point-in-time view of one cached resource.
///
/// `data` is shared: every consumer of the same fetch receives the same
/// `Arc`, so comparing with `Arc::ptr_eq` tells whether two consumers saw
/// the same result.
#[derive(Debug)]
pub struct CacheEntry<T> {
  pub key: ResourceKey,
  pub data: Option<Arc<T>>,
  pub status: FetchStatus,
  pub error: Option<FetchError>,
  /// Wall-clock time of the last successful fetch or write
  pub last_updated: Option<DateTime<Utc>>,
  pub stale_after: Duration,
  /// Whether the next `request` would go to the network
  pub is_stale: bool,
  /// Whether a fetch for this key is currently in flight
  pub is_fetching: bool,
}

// Manual impl: `T` itself does not need to be `Clone`.
impl<T> Clone for CacheEntry<T> {
  fn clone(&self) -> Self {
    Self {
      key: self.key.clone(),
      data: self.data.clone(),
      status: self.status,
      error: self.error.clone(),
      last_updated: self.last_updated,
      stale_after: self.stale_after,
      is_stale: self.is_stale,
      is_fetching: self.is_fetching,
    }
  }
}

impl<T> CacheEntry<T> {
  /// An entry with nothing in it.
  pub fn vacant(key: ResourceKey, stale_after: Duration) -> Self {
    Self {
      key,
      data: None,
      status: FetchStatus::Idle,
      error: None,
      last_updated: None,
      stale_after,
      is_stale: true,
      is_fetching: false,
    }
  }

  pub fn data(&self) -> Option<&T> {
    self.data.as_deref()
  }

  pub fn is_loading(&self) -> bool {
    self.status == FetchStatus::Loading
  }

  pub fn is_success(&self) -> bool {
    self.status == FetchStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == FetchStatus::Error
  }

  /// Last known-good data if there is any, otherwise the error.
  ///
  /// An entry that failed to refresh still yields its previous data; the
  /// error is only surfaced when there is nothing to show.
  pub fn into_result(self) -> Result<Arc<T>, FetchError> {
    match (self.data, self.error) {
      (Some(data), _) => Ok(data),
      (None, Some(err)) => Err(err),
      (None, None) => Err(FetchError::Aborted(format!(
        "no data available for {}",
        self.key
      ))),
    }
  }
}
