//! Consumer handles that follow a single cache entry.
//!
//! A [`Subscription`] is the cache's counterpart of a mounted UI component:
//! it sees every state change of its key (loading, success, error, data
//! replaced, invalidated) and keeps the entry alive while it exists.
//!
//! # Example
//!
//! ```ignore
//! let mut books = cache.subscribe(&keys::books());
//! cache.request(&keys::books(), loader).await;
//!
//! // In an event loop tick
//! if books.poll() {
//!     render(books.current());
//! }
//! ```

use std::sync::Arc;
use tokio::sync::watch;

use super::entry::CacheEntry;
use super::key::ResourceKey;
use super::layer::Inner;
use crate::error::FetchError;

/// A registration against one key. Dropping it unsubscribes; when the last
/// subscription for a key is dropped the entry becomes eligible for garbage
/// collection after the cache's idle period.
pub struct Subscription<T: Send + Sync + 'static> {
  key: ResourceKey,
  receiver: watch::Receiver<CacheEntry<T>>,
  cache: Arc<Inner<T>>,
}

impl<T: Send + Sync + 'static> Subscription<T> {
  pub(super) fn new(
    key: ResourceKey,
    receiver: watch::Receiver<CacheEntry<T>>,
    cache: Arc<Inner<T>>,
  ) -> Self {
    Self {
      key,
      receiver,
      cache,
    }
  }

  pub fn key(&self) -> &ResourceKey {
    &self.key
  }

  /// The latest snapshot, whether or not it has been seen before.
  pub fn current(&self) -> CacheEntry<T> {
    self.receiver.borrow().clone()
  }

  /// Check for a change without waiting.
  ///
  /// Returns `true` if the entry changed since the last `poll` or `changed`.
  /// Call this from a tick handler; read the new state with [`current`].
  ///
  /// [`current`]: Subscription::current
  pub fn poll(&mut self) -> bool {
    match self.receiver.has_changed() {
      Ok(true) => {
        self.receiver.borrow_and_update();
        true
      }
      _ => false,
    }
  }

  /// Wait for the next change and return the new snapshot.
  ///
  /// Returns `None` if the cache has been dropped.
  pub async fn changed(&mut self) -> Option<CacheEntry<T>> {
    self.receiver.changed().await.ok()?;
    Some(self.receiver.borrow_and_update().clone())
  }

  pub fn data(&self) -> Option<Arc<T>> {
    self.receiver.borrow().data.clone()
  }

  pub fn is_loading(&self) -> bool {
    self.receiver.borrow().is_loading()
  }

  pub fn is_stale(&self) -> bool {
    self.receiver.borrow().is_stale
  }

  pub fn error(&self) -> Option<FetchError> {
    self.receiver.borrow().error.clone()
  }
}

impl<T: Send + Sync + 'static> Drop for Subscription<T> {
  fn drop(&mut self) {
    self.cache.unsubscribe(&self.key);
  }
}

impl<T: Send + Sync + std::fmt::Debug + 'static> std::fmt::Debug for Subscription<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("key", &self.key)
      .field("current", &*self.receiver.borrow())
      .finish_non_exhaustive()
  }
}
