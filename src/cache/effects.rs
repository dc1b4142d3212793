//! Cache side effects of a successful mutation.

use super::key::ResourceKey;

type Patch<T> = Box<dyn FnOnce(&T) -> T + Send>;

/// What a mutation does to the cache once the server has accepted it.
///
/// Effects are applied in a fixed order: removals, then invalidations, then
/// writes, then patches. A key that is both invalidated and written ends up
/// fresh, holding the written value.
pub struct CacheEffects<T> {
  pub(super) remove: Vec<ResourceKey>,
  pub(super) invalidate: Vec<ResourceKey>,
  pub(super) invalidate_prefixes: Vec<ResourceKey>,
  pub(super) write: Vec<(ResourceKey, T)>,
  pub(super) patch: Vec<(ResourceKey, Patch<T>)>,
}

impl<T> Default for CacheEffects<T> {
  fn default() -> Self {
    Self {
      remove: Vec::new(),
      invalidate: Vec::new(),
      invalidate_prefixes: Vec::new(),
      write: Vec::new(),
      patch: Vec::new(),
    }
  }
}

impl<T> CacheEffects<T> {
  pub fn new() -> Self {
    Self::default()
  }

  /// Evict the entry for `key`.
  pub fn remove(mut self, key: ResourceKey) -> Self {
    self.remove.push(key);
    self
  }

  /// Mark `key` stale so the next request re-fetches it.
  pub fn invalidate(mut self, key: ResourceKey) -> Self {
    self.invalidate.push(key);
    self
  }

  pub fn invalidate_all<I: IntoIterator<Item = ResourceKey>>(mut self, keys: I) -> Self {
    self.invalidate.extend(keys);
    self
  }

  /// Mark every key starting with `prefix` stale.
  pub fn invalidate_prefix(mut self, prefix: ResourceKey) -> Self {
    self.invalidate_prefixes.push(prefix);
    self
  }

  /// Store `value` under `key` as fresh data.
  pub fn write(mut self, key: ResourceKey, value: T) -> Self {
    self.write.push((key, value));
    self
  }

  /// Rewrite the data already cached under `key`, if any.
  pub fn patch<F>(mut self, key: ResourceKey, f: F) -> Self
  where
    F: FnOnce(&T) -> T + Send + 'static,
  {
    self.patch.push((key, Box::new(f)));
    self
  }

  /// Keys this effect set touches, for logging.
  pub fn keys(&self) -> Vec<&ResourceKey> {
    self
      .remove
      .iter()
      .chain(&self.invalidate)
      .chain(&self.invalidate_prefixes)
      .chain(self.write.iter().map(|(k, _)| k))
      .chain(self.patch.iter().map(|(k, _)| k))
      .collect()
  }
}

impl<T> std::fmt::Debug for CacheEffects<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CacheEffects")
      .field("remove", &self.remove)
      .field("invalidate", &self.invalidate)
      .field("invalidate_prefixes", &self.invalidate_prefixes)
      .field("write", &self.write.iter().map(|(k, _)| k).collect::<Vec<_>>())
      .field("patch", &self.patch.iter().map(|(k, _)| k).collect::<Vec<_>>())
      .finish()
  }
}
