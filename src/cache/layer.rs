//! Resource cache that orchestrates keyed storage with network fetching.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::effects::CacheEffects;
use super::entry::{CacheEntry, FetchStatus};
use super::key::{KeyPolicy, ResourceKey};
use super::retry::RetryPolicy;
use super::subscription::Subscription;
use crate::error::FetchError;

/// Construction-time settings of a [`ResourceCache`].
#[derive(Debug, Clone)]
pub struct CacheOptions {
  /// How long data stays fresh, per key prefix
  pub stale_time: KeyPolicy<Duration>,
  /// Retry policy for fetches, per key prefix
  pub retry: KeyPolicy<RetryPolicy>,
  /// How long an entry with no subscribers is kept before eviction
  pub gc_time: Duration,
}

impl Default for CacheOptions {
  fn default() -> Self {
    Self {
      stale_time: KeyPolicy::new(Duration::ZERO),
      retry: KeyPolicy::new(RetryPolicy::default()),
      gc_time: Duration::from_secs(5 * 60),
    }
  }
}

type Outcome<T> = Result<Arc<T>, FetchError>;
type SharedFetch<T> = Shared<BoxFuture<'static, Outcome<T>>>;
type LoaderFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, FetchError>> + Send + Sync>;

struct InFlight<T> {
  seq: u64,
  fetch: SharedFetch<T>,
}

/// Internal state for one key.
///
/// Sequence numbers come from a cache-wide counter and are taken when a
/// fetch is issued, a value is written, or the key is invalidated. They
/// order those events regardless of when fetches complete.
struct Slot<T> {
  key: ResourceKey,
  data: Option<Arc<T>>,
  status: FetchStatus,
  error: Option<FetchError>,
  last_updated: Option<DateTime<Utc>>,
  updated_at: Option<Instant>,
  stale_after: Duration,
  /// Sequence of the fetch or write that produced `data`
  data_seq: u64,
  /// Sequence of the latest invalidation
  invalidated_seq: u64,
  in_flight: Option<InFlight<T>>,
  subscribers: usize,
  /// Bumped to cancel a pending eviction
  gc_epoch: u64,
  notifier: watch::Sender<CacheEntry<T>>,
}

impl<T> Slot<T> {
  fn new(key: ResourceKey, stale_after: Duration, created_seq: u64) -> Self {
    let (notifier, _) = watch::channel(CacheEntry::vacant(key.clone(), stale_after));
    Self {
      key,
      data: None,
      status: FetchStatus::Idle,
      error: None,
      last_updated: None,
      updated_at: None,
      stale_after,
      // Fetches issued before this slot existed must not land in it.
      data_seq: created_seq,
      invalidated_seq: 0,
      in_flight: None,
      subscribers: 0,
      gc_epoch: 0,
      notifier,
    }
  }

  fn is_invalidated(&self) -> bool {
    self.invalidated_seq > self.data_seq
  }

  fn is_stale(&self, now: Instant) -> bool {
    if self.data.is_none() || self.status != FetchStatus::Success || self.is_invalidated() {
      return true;
    }
    self
      .updated_at
      .map(|at| now.saturating_duration_since(at) >= self.stale_after)
      .unwrap_or(true)
  }

  fn is_vacant(&self) -> bool {
    self.data.is_none() && self.status == FetchStatus::Idle && self.in_flight.is_none()
  }

  /// The in-flight fetch, unless it was issued before the latest invalidation.
  fn reusable_fetch(&self) -> Option<SharedFetch<T>> {
    self
      .in_flight
      .as_ref()
      .filter(|f| f.seq > self.invalidated_seq)
      .map(|f| f.fetch.clone())
  }

  /// Highest sequence issued for this key by a fetch or a write.
  fn latest_issued(&self) -> u64 {
    self
      .in_flight
      .as_ref()
      .map_or(self.data_seq, |f| f.seq.max(self.data_seq))
  }

  fn store(&mut self, data: Arc<T>, seq: u64, now: Instant) {
    self.data = Some(data);
    self.data_seq = seq;
    self.status = FetchStatus::Success;
    self.error = None;
    self.last_updated = Some(Utc::now());
    self.updated_at = Some(now);
  }

  fn reset(&mut self, seq: u64) {
    self.data = None;
    self.status = FetchStatus::Idle;
    self.error = None;
    self.last_updated = None;
    self.updated_at = None;
    self.in_flight = None;
    self.data_seq = seq;
  }

  fn snapshot(&self, now: Instant) -> CacheEntry<T> {
    CacheEntry {
      key: self.key.clone(),
      data: self.data.clone(),
      status: self.status,
      error: self.error.clone(),
      last_updated: self.last_updated,
      stale_after: self.stale_after,
      is_stale: self.is_stale(now),
      is_fetching: self.in_flight.is_some(),
    }
  }

  fn publish(&self, now: Instant) {
    self.notifier.send_replace(self.snapshot(now));
  }
}

/// Shared state behind every clone of a [`ResourceCache`].
pub(super) struct Inner<T> {
  slots: Mutex<HashMap<ResourceKey, Slot<T>>>,
  seq: AtomicU64,
  options: CacheOptions,
}

impl<T: Send + Sync + 'static> Inner<T> {
  fn next_seq(&self) -> u64 {
    self.seq.fetch_add(1, Ordering::SeqCst) + 1
  }

  // The lock is never held across an await, so a poisoned map is still
  // consistent; recover it instead of propagating the panic.
  fn lock(&self) -> MutexGuard<'_, HashMap<ResourceKey, Slot<T>>> {
    self.slots.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn slot_mut<'a>(
    &self,
    slots: &'a mut HashMap<ResourceKey, Slot<T>>,
    key: &ResourceKey,
  ) -> &'a mut Slot<T> {
    slots.entry(key.clone()).or_insert_with(|| {
      Slot::new(
        key.clone(),
        *self.options.stale_time.lookup(key),
        self.next_seq(),
      )
    })
  }

  /// Issue a fetch for `slot` on a spawned task.
  ///
  /// The task stores its own result, so consumers that stop waiting do not
  /// cancel it.
  fn issue_fetch(self: &Arc<Self>, slot: &Slot<T>, loader: LoaderFn<T>) -> InFlight<T> {
    let seq = self.next_seq();
    let key = slot.key.clone();
    let retry = *self.options.retry.lookup(&key);
    let inner = Arc::clone(self);

    let task = tokio::spawn(async move {
      let outcome = retry.run(&key, || loader()).await.map(Arc::new);
      inner.complete(&key, seq, &outcome);
      outcome
    });
    let fetch = async move {
      task
        .await
        .unwrap_or_else(|err| Err(FetchError::Aborted(err.to_string())))
    }
    .boxed()
    .shared();

    debug!(key = %slot.key, seq, "fetch started");
    InFlight { seq, fetch }
  }

  /// Register `in_flight` as the key's current fetch.
  fn register(&self, slot: &mut Slot<T>, in_flight: InFlight<T>, now: Instant) {
    slot.in_flight = Some(in_flight);
    slot.gc_epoch += 1;
    if slot.data.is_none() {
      slot.status = FetchStatus::Loading;
    }
    slot.publish(now);
  }

  /// Start a background refresh nobody waits on.
  fn spawn_fetch(self: &Arc<Self>, slot: &mut Slot<T>, loader: LoaderFn<T>, now: Instant) {
    let in_flight = self.issue_fetch(slot, loader);
    self.register(slot, in_flight, now);
  }

  /// Start a fetch and hand back the future to wait on.
  fn start_fetch(self: &Arc<Self>, slot: &mut Slot<T>, loader: LoaderFn<T>, now: Instant) -> SharedFetch<T> {
    let in_flight = self.issue_fetch(slot, loader);
    let fetch = in_flight.fetch.clone();
    self.register(slot, in_flight, now);
    fetch
  }

  fn complete(self: &Arc<Self>, key: &ResourceKey, seq: u64, outcome: &Outcome<T>) {
    let mut slots = self.lock();
    let Some(slot) = slots.get_mut(key) else {
      debug!(%key, seq, "entry evicted before fetch completed");
      return;
    };

    let superseded = slot.in_flight.as_ref().is_some_and(|f| f.seq > seq);
    if slot.in_flight.as_ref().is_some_and(|f| f.seq == seq) {
      slot.in_flight = None;
    }

    let now = Instant::now();
    if seq < slot.data_seq {
      debug!(%key, seq, newer = slot.data_seq, "discarding out-of-order fetch result");
    } else {
      match outcome {
        Ok(data) => slot.store(Arc::clone(data), seq, now),
        // A newer fetch will settle the entry; don't flash an error meanwhile.
        Err(err) if superseded => {
          debug!(%key, seq, error = %err, "superseded fetch failed");
        }
        Err(err) => {
          debug!(%key, seq, error = %err, "fetch failed");
          slot.status = FetchStatus::Error;
          slot.error = Some(err.clone());
        }
      }
    }

    slot.publish(now);
    if slot.subscribers == 0 {
      self.schedule_gc(slot);
    }
  }

  /// Returns `false` if the slot was already invalidated and nothing has
  /// been issued for it since.
  fn mark_invalidated(&self, slot: &mut Slot<T>, now: Instant) -> bool {
    if slot.invalidated_seq > slot.latest_issued() {
      return false;
    }
    let was_stale = slot.is_stale(now);
    slot.invalidated_seq = self.next_seq();
    trace!(key = %slot.key, seq = slot.invalidated_seq, "invalidated");
    if !was_stale {
      slot.publish(now);
    }
    true
  }

  fn write(self: &Arc<Self>, slot: &mut Slot<T>, data: Arc<T>, now: Instant) {
    let seq = self.next_seq();
    slot.store(data, seq, now);
    slot.publish(now);
    if slot.subscribers == 0 {
      self.schedule_gc(slot);
    }
  }

  /// Drop the entry, or reset it to vacant if someone is still subscribed.
  fn evict(&self, slots: &mut HashMap<ResourceKey, Slot<T>>, key: &ResourceKey, now: Instant) {
    let subscribed = match slots.get(key) {
      Some(slot) => slot.subscribers > 0,
      None => return,
    };
    if subscribed {
      let seq = self.next_seq();
      if let Some(slot) = slots.get_mut(key) {
        slot.reset(seq);
        slot.publish(now);
      }
    } else {
      slots.remove(key);
    }
    debug!(%key, "removed entry");
  }

  fn schedule_gc(self: &Arc<Self>, slot: &mut Slot<T>) {
    slot.gc_epoch += 1;
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      return;
    };

    let epoch = slot.gc_epoch;
    let key = slot.key.clone();
    let cache = Arc::downgrade(self);
    let gc_time = self.options.gc_time;
    runtime.spawn(async move {
      tokio::time::sleep(gc_time).await;
      if let Some(inner) = cache.upgrade() {
        inner.collect(&key, epoch);
      }
    });
  }

  fn collect(&self, key: &ResourceKey, epoch: u64) {
    let mut slots = self.lock();
    let idle = slots.get(key).is_some_and(|slot| {
      slot.subscribers == 0 && slot.gc_epoch == epoch && slot.in_flight.is_none()
    });
    if idle {
      slots.remove(key);
      debug!(%key, "evicted idle entry");
    }
  }

  pub(super) fn unsubscribe(self: &Arc<Self>, key: &ResourceKey) {
    let mut slots = self.lock();
    if let Some(slot) = slots.get_mut(key) {
      slot.subscribers = slot.subscribers.saturating_sub(1);
      if slot.subscribers == 0 {
        self.schedule_gc(slot);
      }
    }
  }
}

enum Plan<T> {
  Ready(CacheEntry<T>),
  Wait(SharedFetch<T>),
}

/// What a waiter finds once its fetch resolved.
enum Settled<T> {
  Done(CacheEntry<T>),
  /// Still loading under a newer fetch
  Pending(SharedFetch<T>),
  /// Removed, or left without a result to show
  Detached,
}

/// Keyed cache of remote resources.
///
/// - `request` serves fresh data without I/O, serves stale data while
///   refreshing in the background, and otherwise waits for a fetch
/// - concurrent requests for a key share one in-flight fetch
/// - transient failures are retried per the key's [`RetryPolicy`]
/// - `mutate` applies [`CacheEffects`] only when the mutation succeeds
/// - subscribers see every change of their key
///
/// Cloning is cheap; all clones share the same entries.
pub struct ResourceCache<T> {
  inner: Arc<Inner<T>>,
}

impl<T> Clone for ResourceCache<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T: Send + Sync + 'static> Default for ResourceCache<T> {
  fn default() -> Self {
    Self::new(CacheOptions::default())
  }
}

impl<T: Send + Sync + 'static> ResourceCache<T> {
  pub fn new(options: CacheOptions) -> Self {
    Self {
      inner: Arc::new(Inner {
        slots: Mutex::new(HashMap::new()),
        seq: AtomicU64::new(0),
        options,
      }),
    }
  }

  /// Look up an entry without any network I/O.
  ///
  /// Returns `None` for keys that were never requested, were removed, or
  /// were garbage collected.
  pub fn get(&self, key: &ResourceKey) -> Option<CacheEntry<T>> {
    let slots = self.inner.lock();
    let now = Instant::now();
    slots
      .get(key)
      .filter(|slot| !slot.is_vacant())
      .map(|slot| slot.snapshot(now))
  }

  /// Number of entries holding data or a fetch.
  pub fn len(&self) -> usize {
    self.inner.lock().values().filter(|s| !s.is_vacant()).count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Get the entry for `key`, fetching it if needed.
  ///
  /// 1. Fresh data is returned immediately
  /// 2. Stale data is returned immediately and a background refresh starts
  /// 3. Without data, wait for the in-flight fetch (or start one)
  pub async fn request<F, Fut>(&self, key: &ResourceKey, loader: F) -> CacheEntry<T>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    match self.plan(key, boxed_loader(loader), false) {
      Plan::Ready(entry) => entry,
      Plan::Wait(fetch) => self.settle(key, fetch.await).await,
    }
  }

  /// Wait for data issued after the key's latest invalidation, even if the
  /// cached data is still fresh.
  pub async fn fetch<F, Fut>(&self, key: &ResourceKey, loader: F) -> CacheEntry<T>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    match self.plan(key, boxed_loader(loader), true) {
      Plan::Ready(entry) => entry,
      Plan::Wait(fetch) => self.settle(key, fetch.await).await,
    }
  }

  /// Like [`request`](Self::request), but the caller may stop waiting by
  /// cancelling `token`. The underlying fetch keeps running and its result
  /// is still stored.
  pub async fn request_cancellable<F, Fut>(
    &self,
    key: &ResourceKey,
    loader: F,
    token: &CancellationToken,
  ) -> Result<CacheEntry<T>, FetchError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    tokio::select! {
      _ = token.cancelled() => {
        debug!(%key, "consumer cancelled request");
        Err(FetchError::Cancelled)
      }
      entry = self.request(key, loader) => Ok(entry),
    }
  }

  fn plan(&self, key: &ResourceKey, loader: LoaderFn<T>, force: bool) -> Plan<T> {
    let mut slots = self.inner.lock();
    let now = Instant::now();
    let slot = self.inner.slot_mut(&mut slots, key);

    if !force && slot.data.is_some() {
      if !slot.is_stale(now) {
        trace!(%key, "cache hit");
      } else if slot.reusable_fetch().is_none() {
        debug!(%key, "serving stale data, refreshing in background");
        self.inner.spawn_fetch(slot, loader, now);
      }
      return Plan::Ready(slot.snapshot(now));
    }

    let fetch = match slot.reusable_fetch() {
      Some(fetch) => {
        debug!(%key, "joining in-flight fetch");
        fetch
      }
      None => self.inner.start_fetch(slot, loader, now),
    };
    Plan::Wait(fetch)
  }

  /// Turn a resolved fetch into the entry handed to its waiters.
  ///
  /// A failed fetch that was superseded leaves the entry loading; its
  /// waiters follow the newer fetch instead of returning an unsettled entry.
  async fn settle(&self, key: &ResourceKey, mut outcome: Outcome<T>) -> CacheEntry<T> {
    loop {
      match self.settled(key) {
        Settled::Done(entry) => return entry,
        Settled::Pending(fetch) => {
          debug!(%key, "following newer fetch");
          outcome = fetch.await;
        }
        Settled::Detached => return self.detached(key, outcome),
      }
    }
  }

  fn settled(&self, key: &ResourceKey) -> Settled<T> {
    let slots = self.inner.lock();
    let Some(slot) = slots.get(key).filter(|slot| !slot.is_vacant()) else {
      return Settled::Detached;
    };
    let unsettled = slot.data.is_none()
      && slot.error.is_none()
      && matches!(slot.status, FetchStatus::Idle | FetchStatus::Loading);
    if !unsettled {
      return Settled::Done(slot.snapshot(Instant::now()));
    }
    match &slot.in_flight {
      Some(in_flight) => Settled::Pending(in_flight.fetch.clone()),
      None => Settled::Detached,
    }
  }

  /// An entry built from the waiter's own outcome without caching it.
  fn detached(&self, key: &ResourceKey, outcome: Outcome<T>) -> CacheEntry<T> {
    let mut entry = CacheEntry::vacant(key.clone(), *self.inner.options.stale_time.lookup(key));
    match outcome {
      Ok(data) => {
        entry.data = Some(data);
        entry.status = FetchStatus::Success;
        entry.last_updated = Some(Utc::now());
      }
      Err(err) => {
        entry.status = FetchStatus::Error;
        entry.error = Some(err);
      }
    }
    entry
  }

  /// Mark entries stale so the next `request` for each goes to the network.
  ///
  /// Returns how many entries were newly invalidated. Invalidating an entry
  /// that is already invalidated, with nothing fetched since, does nothing.
  pub fn invalidate<'a, I>(&self, keys: I) -> usize
  where
    I: IntoIterator<Item = &'a ResourceKey>,
  {
    let mut slots = self.inner.lock();
    let now = Instant::now();
    let mut count = 0;
    for key in keys {
      if let Some(slot) = slots.get_mut(key) {
        if self.inner.mark_invalidated(slot, now) {
          count += 1;
        }
      }
    }
    count
  }

  /// Invalidate every entry whose key starts with `prefix`.
  pub fn invalidate_prefix(&self, prefix: &ResourceKey) -> usize {
    let mut slots = self.inner.lock();
    let now = Instant::now();
    let mut count = 0;
    for slot in slots.values_mut() {
      if slot.key.starts_with(prefix) && self.inner.mark_invalidated(slot, now) {
        count += 1;
      }
    }
    count
  }

  /// Store `value` under `key` as fresh data, as if just fetched.
  pub fn set_data(&self, key: &ResourceKey, value: T) -> Arc<T> {
    let data = Arc::new(value);
    let mut slots = self.inner.lock();
    let now = Instant::now();
    let slot = self.inner.slot_mut(&mut slots, key);
    self.inner.write(slot, Arc::clone(&data), now);
    data
  }

  /// Rewrite cached data in place. Staleness is left as it was.
  ///
  /// Returns `false` if there was no data for `key`.
  pub fn update_data<F>(&self, key: &ResourceKey, f: F) -> bool
  where
    F: FnOnce(&T) -> T,
  {
    let mut slots = self.inner.lock();
    let Some(slot) = slots.get_mut(key) else {
      return false;
    };
    let Some(current) = slot.data.as_ref() else {
      return false;
    };
    slot.data = Some(Arc::new(f(current)));
    slot.publish(Instant::now());
    true
  }

  /// Evict entries. Late results of fetches issued before the removal are
  /// discarded.
  pub fn remove<'a, I>(&self, keys: I)
  where
    I: IntoIterator<Item = &'a ResourceKey>,
  {
    let mut slots = self.inner.lock();
    let now = Instant::now();
    for key in keys {
      self.inner.evict(&mut slots, key, now);
    }
  }

  /// Evict everything, e.g. when the signed-in identity changes or at
  /// shutdown.
  pub fn clear(&self) {
    let mut slots = self.inner.lock();
    let now = Instant::now();
    let keys: Vec<ResourceKey> = slots.keys().cloned().collect();
    for key in &keys {
      self.inner.evict(&mut slots, key, now);
    }
  }

  /// Apply the effects of a successful mutation.
  pub fn apply(&self, effects: CacheEffects<T>) {
    let CacheEffects {
      remove,
      invalidate,
      invalidate_prefixes,
      write,
      patch,
    } = effects;

    self.remove(&remove);
    self.invalidate(&invalidate);
    for prefix in &invalidate_prefixes {
      self.invalidate_prefix(prefix);
    }
    for (key, value) in write {
      self.set_data(&key, value);
    }
    for (key, f) in patch {
      self.update_data(&key, f);
    }
  }

  /// Run a mutation and, only if it succeeds, apply the cache effects
  /// derived from its result.
  ///
  /// On failure the cache is left untouched and the error is returned.
  pub async fn mutate<R, Fut, E>(&self, op: Fut, effects: E) -> Result<R, FetchError>
  where
    Fut: Future<Output = Result<R, FetchError>>,
    E: FnOnce(&R) -> CacheEffects<T>,
  {
    match op.await {
      Ok(value) => {
        let effects = effects(&value);
        debug!(keys = ?effects.keys(), "mutation succeeded, applying cache effects");
        self.apply(effects);
        Ok(value)
      }
      Err(err) => {
        debug!(error = %err, "mutation failed, cache unchanged");
        Err(err)
      }
    }
  }

  /// Follow every change of `key`. The entry is created if it does not exist.
  pub fn subscribe(&self, key: &ResourceKey) -> Subscription<T> {
    let mut slots = self.inner.lock();
    let slot = self.inner.slot_mut(&mut slots, key);
    slot.subscribers += 1;
    slot.gc_epoch += 1;
    Subscription::new(key.clone(), slot.notifier.subscribe(), Arc::clone(&self.inner))
  }
}

impl<T> std::fmt::Debug for ResourceCache<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ResourceCache")
      .field("options", &self.inner.options)
      .finish_non_exhaustive()
  }
}

fn boxed_loader<T, F, Fut>(loader: F) -> LoaderFn<T>
where
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
{
  Arc::new(move || loader().boxed())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  type Books = Vec<&'static str>;

  /// A loader that counts calls, waits `delay`, then returns `value`.
  fn counting_loader(
    calls: &Arc<AtomicUsize>,
    delay: Duration,
    value: Books,
  ) -> impl Fn() -> BoxFuture<'static, Result<Books, FetchError>> + Send + Sync + 'static {
    let calls = Arc::clone(calls);
    move || {
      calls.fetch_add(1, Ordering::SeqCst);
      let value = value.clone();
      async move {
        tokio::time::sleep(delay).await;
        Ok(value)
      }
      .boxed()
    }
  }

  fn failing_loader(
    calls: &Arc<AtomicUsize>,
    error: FetchError,
  ) -> impl Fn() -> BoxFuture<'static, Result<Books, FetchError>> + Send + Sync + 'static {
    let calls = Arc::clone(calls);
    move || {
      calls.fetch_add(1, Ordering::SeqCst);
      let error = error.clone();
      async move { Err(error) }.boxed()
    }
  }

  fn cache_with_stale_time(stale: Duration) -> ResourceCache<Books> {
    ResourceCache::new(CacheOptions {
      stale_time: KeyPolicy::new(stale),
      ..CacheOptions::default()
    })
  }

  fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_requests_share_one_fetch() {
    let cache = cache_with_stale_time(Duration::ZERO);
    let calls = Arc::new(AtomicUsize::new(0));
    let key = ResourceKey::collection("books");

    let (a, b) = tokio::join!(
      cache.request(&key, counting_loader(&calls, ms(10), vec!["b1"])),
      cache.request(&key, counting_loader(&calls, ms(10), vec!["b1"])),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.data(), Some(&vec!["b1"]));
    assert!(Arc::ptr_eq(a.data.as_ref().unwrap(), b.data.as_ref().unwrap()));
    assert!(a.is_success());
  }

  #[tokio::test(start_paused = true)]
  async fn test_fresh_entry_is_served_without_network() {
    let cache = cache_with_stale_time(Duration::from_secs(60));
    let calls = Arc::new(AtomicUsize::new(0));
    let key = ResourceKey::collection("categories");

    cache.request(&key, counting_loader(&calls, ms(1), vec!["c1"])).await;
    let entry = cache.request(&key, counting_loader(&calls, ms(1), vec!["c2"])).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(entry.data(), Some(&vec!["c1"]));
    assert!(!entry.is_stale);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_entry_is_served_while_refreshing() {
    let cache = cache_with_stale_time(Duration::from_secs(60));
    let calls = Arc::new(AtomicUsize::new(0));
    let key = ResourceKey::collection("books");

    cache.request(&key, counting_loader(&calls, ms(1), vec!["old"])).await;
    tokio::time::advance(Duration::from_secs(61)).await;

    let entry = cache.request(&key, counting_loader(&calls, ms(50), vec!["new"])).await;
    assert_eq!(entry.data(), Some(&vec!["old"]));
    assert!(entry.is_stale);
    assert!(entry.is_fetching);

    tokio::time::sleep(ms(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.get(&key).unwrap().data(), Some(&vec!["new"]));
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_forces_refetch() {
    let cache = cache_with_stale_time(Duration::from_secs(60));
    let calls = Arc::new(AtomicUsize::new(0));
    let key = ResourceKey::collection("orders");

    cache.request(&key, counting_loader(&calls, ms(1), vec!["o1"])).await;
    assert_eq!(cache.invalidate([&key]), 1);
    assert!(cache.get(&key).unwrap().is_stale);

    let entry = cache.fetch(&key, counting_loader(&calls, ms(1), vec!["o1", "o2"])).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(entry.data(), Some(&vec!["o1", "o2"]));
    assert!(!entry.is_stale);
  }

  #[tokio::test(start_paused = true)]
  async fn test_repeated_invalidate_is_noop() {
    let cache = cache_with_stale_time(Duration::from_secs(60));
    let calls = Arc::new(AtomicUsize::new(0));
    let key = ResourceKey::collection("orders");

    cache.request(&key, counting_loader(&calls, ms(1), vec!["o1"])).await;
    let mut sub = cache.subscribe(&key);

    assert_eq!(cache.invalidate([&key]), 1);
    assert!(sub.poll());
    assert_eq!(cache.invalidate([&key]), 0);
    assert!(!sub.poll());

    // One background refresh, shared by both requests
    cache.request(&key, counting_loader(&calls, ms(10), vec!["o2"])).await;
    cache.request(&key, counting_loader(&calls, ms(10), vec!["o2"])).await;
    tokio::time::sleep(ms(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_refresh_issued_before_invalidate_is_not_reused() {
    let cache = cache_with_stale_time(Duration::from_secs(60));
    let calls = Arc::new(AtomicUsize::new(0));
    let key = ResourceKey::collection("orders");

    cache.request(&key, counting_loader(&calls, ms(1), vec!["o1"])).await;
    tokio::time::advance(Duration::from_secs(61)).await;

    // Background refresh pending when the invalidation lands
    cache.request(&key, counting_loader(&calls, ms(50), vec!["o2"])).await;
    assert_eq!(cache.invalidate([&key]), 1);
    let entry = cache.request(&key, counting_loader(&calls, ms(50), vec!["o3"])).await;
    assert!(entry.is_stale);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    tokio::time::sleep(ms(100)).await;
    let entry = cache.get(&key).unwrap();
    assert_eq!(entry.data(), Some(&vec!["o3"]));
    assert!(!entry.is_stale);
  }

  #[tokio::test(start_paused = true)]
  async fn test_older_fetch_never_overwrites_newer_result() {
    let cache = cache_with_stale_time(Duration::from_secs(60));
    let calls = Arc::new(AtomicUsize::new(0));
    let key = ResourceKey::collection("books");

    // T1: slow fetch issued first
    let slow_cache = cache.clone();
    let slow_key = key.clone();
    let slow_calls = Arc::clone(&calls);
    let slow = tokio::spawn(async move {
      slow_cache
        .request(&slow_key, counting_loader(&slow_calls, ms(100), vec!["t1"]))
        .await
    });
    tokio::time::sleep(ms(1)).await;

    // T2: issued after an invalidation, resolves first
    cache.invalidate([&key]);
    let fast = cache.fetch(&key, counting_loader(&calls, ms(10), vec!["t2"])).await;
    assert_eq!(fast.data(), Some(&vec!["t2"]));

    slow.await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let entry = cache.get(&key).unwrap();
    assert_eq!(entry.data(), Some(&vec!["t2"]));
    assert!(!entry.is_stale);
  }

  #[tokio::test(start_paused = true)]
  async fn test_waiter_of_superseded_failure_gets_newer_result() {
    let cache = cache_with_stale_time(Duration::ZERO);
    let calls = Arc::new(AtomicUsize::new(0));
    let key = ResourceKey::collection("books");

    // First load fails after 50ms, but is replaced before that
    let first_cache = cache.clone();
    let first_key = key.clone();
    let first_calls = Arc::clone(&calls);
    let first = tokio::spawn(async move {
      first_cache
        .request(&first_key, move || {
          first_calls.fetch_add(1, Ordering::SeqCst);
          async move {
            tokio::time::sleep(ms(50)).await;
            Err::<Books, _>(FetchError::Http {
              status: 404,
              body: String::new(),
            })
          }
          .boxed()
        })
        .await
    });
    tokio::time::sleep(ms(10)).await;

    cache.invalidate([&key]);
    let second = cache.request(&key, counting_loader(&calls, ms(100), vec!["b1"]));
    let (first, second) = tokio::join!(first, second);
    let first = first.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(first.status, FetchStatus::Success);
    assert_eq!(first.data(), Some(&vec!["b1"]));
    assert!(!first.is_fetching);
    assert_eq!(second.data(), Some(&vec!["b1"]));
  }

  #[tokio::test(start_paused = true)]
  async fn test_error_keeps_last_good_data() {
    let cache = cache_with_stale_time(Duration::ZERO);
    let calls = Arc::new(AtomicUsize::new(0));
    let key = ResourceKey::collection("books");

    cache.request(&key, counting_loader(&calls, ms(1), vec!["b1"])).await;
    let not_found = FetchError::Http {
      status: 404,
      body: String::new(),
    };
    let entry = cache.fetch(&key, failing_loader(&calls, not_found.clone())).await;

    assert!(entry.is_error());
    assert_eq!(entry.error, Some(not_found));
    assert_eq!(entry.data(), Some(&vec!["b1"]));
  }

  #[tokio::test(start_paused = true)]
  async fn test_transient_failure_surfaces_to_all_waiters_after_retries() {
    let cache = cache_with_stale_time(Duration::from_secs(300));
    let calls = Arc::new(AtomicUsize::new(0));
    let key = ResourceKey::collection("transactions");
    let err = FetchError::Network("connection refused".into());
    let start = Instant::now();

    let (a, b) = tokio::join!(
      cache.request(&key, failing_loader(&calls, err.clone())),
      cache.request(&key, failing_loader(&calls, err.clone())),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // Backoff of 1s then 2s before the error surfaces
    assert!(start.elapsed() >= Duration::from_secs(3));
    assert!(start.elapsed() < Duration::from_secs(4));
    assert_eq!(a.error, Some(err.clone()));
    assert_eq!(b.error, Some(err));
    assert!(a.data.is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_mutation_failure_leaves_cache_untouched() {
    let cache = cache_with_stale_time(Duration::from_secs(60));
    let calls = Arc::new(AtomicUsize::new(0));
    let key = ResourceKey::collection("books");
    cache.request(&key, counting_loader(&calls, ms(1), vec!["b1"])).await;

    let result: Result<(), _> = cache
      .mutate(
        async {
          Err(FetchError::Http {
            status: 500,
            body: "boom".into(),
          })
        },
        |_| CacheEffects::new().invalidate(ResourceKey::collection("books")),
      )
      .await;

    assert!(result.is_err());
    assert!(!cache.get(&key).unwrap().is_stale);
  }

  #[tokio::test(start_paused = true)]
  async fn test_mutation_applies_effects_in_order() {
    let cache = cache_with_stale_time(Duration::from_secs(60));
    let calls = Arc::new(AtomicUsize::new(0));
    let list = ResourceKey::collection("books");
    let item = ResourceKey::item("book", "b1");
    let gone = ResourceKey::item("book", "b2");

    cache.request(&list, counting_loader(&calls, ms(1), vec!["b1", "b2"])).await;
    cache.request(&gone, counting_loader(&calls, ms(1), vec!["b2"])).await;

    let written = cache
      .mutate(async { Ok(vec!["b1-updated"]) }, |updated| {
        CacheEffects::new()
          .remove(ResourceKey::item("book", "b2"))
          .invalidate(ResourceKey::collection("books"))
          .invalidate(ResourceKey::item("book", "b1"))
          .write(ResourceKey::item("book", "b1"), updated.clone())
          .patch(ResourceKey::collection("books"), |old: &Books| {
            old.iter().copied().filter(|b| *b != "b2").collect()
          })
      })
      .await
      .unwrap();

    assert_eq!(written, vec!["b1-updated"]);
    assert!(cache.get(&gone).is_none());

    let item_entry = cache.get(&item).unwrap();
    assert_eq!(item_entry.data(), Some(&vec!["b1-updated"]));
    assert!(!item_entry.is_stale);

    let list_entry = cache.get(&list).unwrap();
    assert_eq!(list_entry.data(), Some(&vec!["b1"]));
    assert!(list_entry.is_stale);
  }

  #[tokio::test(start_paused = true)]
  async fn test_removed_entry_ignores_late_fetch() {
    let cache = cache_with_stale_time(Duration::ZERO);
    let calls = Arc::new(AtomicUsize::new(0));
    let key = ResourceKey::item("book", "b1");

    let pending_cache = cache.clone();
    let pending_key = key.clone();
    let pending_calls = Arc::clone(&calls);
    let pending = tokio::spawn(async move {
      pending_cache
        .request(&pending_key, counting_loader(&pending_calls, ms(50), vec!["b1"]))
        .await
    });
    tokio::time::sleep(ms(1)).await;

    cache.remove([&key]);
    let entry = pending.await.unwrap();

    // The waiter still gets its result, but nothing is cached
    assert_eq!(entry.data(), Some(&vec!["b1"]));
    assert!(cache.get(&key).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_subscriber_sees_loading_then_success() {
    let cache = cache_with_stale_time(Duration::ZERO);
    let calls = Arc::new(AtomicUsize::new(0));
    let key = ResourceKey::collection("categories");
    let mut sub = cache.subscribe(&key);
    assert_eq!(sub.current().status, FetchStatus::Idle);

    let requester = cache.clone();
    let request_key = key.clone();
    let loader = counting_loader(&calls, ms(10), vec!["c1"]);
    tokio::spawn(async move { requester.request(&request_key, loader).await });

    let loading = sub.changed().await.unwrap();
    assert_eq!(loading.status, FetchStatus::Loading);
    let done = sub.changed().await.unwrap();
    assert_eq!(done.status, FetchStatus::Success);
    assert_eq!(sub.data().as_deref(), Some(&vec!["c1"]));
  }

  #[tokio::test(start_paused = true)]
  async fn test_entry_is_collected_after_last_subscriber_leaves() {
    let cache = ResourceCache::new(CacheOptions {
      gc_time: Duration::from_secs(60),
      ..CacheOptions::default()
    });
    let calls = Arc::new(AtomicUsize::new(0));
    let key = ResourceKey::collection("books");

    let sub = cache.subscribe(&key);
    cache.request(&key, counting_loader(&calls, ms(1), vec!["b1"])).await;

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(cache.get(&key).is_some(), "subscribed entries are never collected");

    drop(sub);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(cache.get(&key).is_some());

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(cache.get(&key).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_resubscribe_cancels_pending_eviction() {
    let cache = ResourceCache::new(CacheOptions {
      gc_time: Duration::from_secs(60),
      ..CacheOptions::default()
    });
    let calls = Arc::new(AtomicUsize::new(0));
    let key = ResourceKey::collection("books");

    drop(cache.subscribe(&key));
    cache.request(&key, counting_loader(&calls, ms(1), vec!["b1"])).await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    let _sub = cache.subscribe(&key);
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(cache.get(&key).is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancelled_consumer_does_not_cancel_fetch() {
    let cache = cache_with_stale_time(Duration::from_secs(60));
    let calls = Arc::new(AtomicUsize::new(0));
    let key = ResourceKey::collection("transactions");
    let token = CancellationToken::new();

    let canceller = token.clone();
    tokio::spawn(async move {
      tokio::time::sleep(ms(10)).await;
      canceller.cancel();
    });

    let result = cache
      .request_cancellable(&key, counting_loader(&calls, ms(100), vec!["t1"]), &token)
      .await;
    assert_eq!(result.unwrap_err(), FetchError::Cancelled);

    tokio::time::sleep(ms(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get(&key).unwrap().data(), Some(&vec!["t1"]));
  }

  #[tokio::test(start_paused = true)]
  async fn test_clear_resets_subscribed_entries() {
    let cache = cache_with_stale_time(Duration::from_secs(60));
    let calls = Arc::new(AtomicUsize::new(0));
    let key = ResourceKey::collection("orders");
    let other = ResourceKey::collection("books");

    let mut sub = cache.subscribe(&key);
    cache.request(&key, counting_loader(&calls, ms(1), vec!["o1"])).await;
    cache.request(&other, counting_loader(&calls, ms(1), vec!["b1"])).await;
    sub.poll();

    cache.clear();
    assert!(cache.is_empty());
    assert!(sub.poll());
    assert_eq!(sub.current().status, FetchStatus::Idle);
    assert!(sub.data().is_none());
  }

  #[test]
  fn test_get_without_runtime_never_fetches() {
    let cache: ResourceCache<Books> = ResourceCache::default();
    assert!(cache.get(&"books".into()).is_none());
    cache.invalidate([&ResourceKey::collection("books")]);
    assert!(cache.is_empty());
  }
}
