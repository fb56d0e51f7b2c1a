//! In-memory query cache with staleness, invalidation and observers.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::key::{CacheKey, KeyFilter};
use crate::config::CacheConfig;
use crate::error::{ApiError, ApiResult};

/// Produces fresh data for one key.
pub type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, ApiResult<Value>> + Send + Sync>;

/// Observer callback.
pub type Listener = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

/// The state of a cached query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// Never fetched
  Idle,
  /// A fetch is in progress
  Loading,
  /// Holds data from the server or an optimistic write
  Success,
  /// The last fetch failed
  Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEventKind {
  Updated,
  StatusChanged,
  Invalidated,
  Removed,
}

/// Delivered to observers after every state transition of their key.
#[derive(Debug, Clone)]
pub struct CacheEvent {
  pub key: CacheKey,
  pub kind: CacheEventKind,
  pub status: QueryStatus,
}

/// Read-only view of an entry.
#[derive(Debug, Clone)]
pub struct EntryInfo {
  pub data: Option<Value>,
  pub status: QueryStatus,
  pub fetched_at: Option<Instant>,
  pub stale_after: Duration,
  pub is_stale: bool,
  pub observers: usize,
  pub error: Option<ApiError>,
}

/// Everything needed to put an entry back exactly as it was.
#[derive(Debug, Clone)]
pub(crate) struct EntrySnapshot {
  present: bool,
  data: Option<Value>,
  fetched_at: Option<Instant>,
  stale_after: Duration,
  status: QueryStatus,
  invalidated: bool,
  error: Option<ApiError>,
}

/// A synchronous write applied to one key's data.
pub(crate) type UpdateFn = Box<dyn FnOnce(Option<&Value>) -> Option<Value> + Send>;

#[derive(Debug, Clone, Default)]
pub struct SetOptions {
  /// Overrides the store's default freshness window
  pub stale_after: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheOptions {
  pub stale_time: Duration,
  pub gc_time: Duration,
  pub max_entries: usize,
}

impl Default for CacheOptions {
  fn default() -> Self {
    Self::from(&CacheConfig::default())
  }
}

impl From<&CacheConfig> for CacheOptions {
  fn from(config: &CacheConfig) -> Self {
    Self {
      stale_time: Duration::from_secs(config.stale_time_secs),
      gc_time: Duration::from_secs(config.gc_time_secs),
      max_entries: config.max_entries,
    }
  }
}

struct Entry {
  data: Option<Value>,
  fetched_at: Option<Instant>,
  stale_after: Duration,
  status: QueryStatus,
  invalidated: bool,
  error: Option<ApiError>,
  /// Logical time of the last data write (fetch, set, patch, restore, invalidation)
  version: u64,
  last_access: Instant,
  observers: Vec<(u64, Listener)>,
  fetcher: Option<Fetcher>,
  refetch: Option<AbortHandle>,
}

impl Entry {
  fn blank(stale_after: Duration) -> Self {
    Self {
      data: None,
      fetched_at: None,
      stale_after,
      status: QueryStatus::Idle,
      invalidated: false,
      error: None,
      version: 0,
      last_access: Instant::now(),
      observers: Vec::new(),
      fetcher: None,
      refetch: None,
    }
  }

  fn is_stale(&self) -> bool {
    if self.invalidated || self.data.is_none() {
      return true;
    }
    match self.fetched_at {
      Some(at) => at.elapsed() >= self.stale_after,
      None => true,
    }
  }

  fn snapshot(&self) -> EntrySnapshot {
    EntrySnapshot {
      present: true,
      data: self.data.clone(),
      fetched_at: self.fetched_at,
      stale_after: self.stale_after,
      status: self.status,
      invalidated: self.invalidated,
      error: self.error.clone(),
    }
  }

  /// Status to fall back to when a fetch ends without writing.
  fn settle_loading(&mut self) {
    if self.status == QueryStatus::Loading {
      self.status = if self.data.is_some() {
        QueryStatus::Success
      } else {
        QueryStatus::Idle
      };
    }
  }
}

#[derive(Default)]
struct State {
  entries: HashMap<CacheKey, Entry>,
  clock: u64,
  next_observer: u64,
}

impl State {
  fn tick(&mut self) -> u64 {
    self.clock += 1;
    self.clock
  }
}

struct Inner {
  state: Mutex<State>,
  options: CacheOptions,
}

type Notifications = Vec<(Listener, CacheEvent)>;

/// Keyed, TTL-aware store of server-derived data.
///
/// Every mutation of an entry happens inside one lock section; observers are
/// notified after the lock is released, so they may call back into the store.
#[derive(Clone)]
pub struct CacheStore {
  inner: Arc<Inner>,
}

impl Default for CacheStore {
  fn default() -> Self {
    Self::new(CacheOptions::default())
  }
}

impl CacheStore {
  pub fn new(options: CacheOptions) -> Self {
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(State::default()),
        options,
      }),
    }
  }

  pub fn options(&self) -> CacheOptions {
    self.inner.options
  }

  /// Current data for `key`, fresh or not.
  pub fn get(&self, key: &CacheKey) -> Option<Value> {
    let mut state = self.inner.state.lock();
    let entry = state.entries.get_mut(key)?;
    entry.last_access = Instant::now();
    entry.data.clone()
  }

  pub fn status(&self, key: &CacheKey) -> QueryStatus {
    self
      .inner
      .state
      .lock()
      .entries
      .get(key)
      .map_or(QueryStatus::Idle, |e| e.status)
  }

  pub fn entry_info(&self, key: &CacheKey) -> Option<EntryInfo> {
    let state = self.inner.state.lock();
    state.entries.get(key).map(|e| EntryInfo {
      data: e.data.clone(),
      status: e.status,
      fetched_at: e.fetched_at,
      stale_after: e.stale_after,
      is_stale: e.is_stale(),
      observers: e.observers.len(),
      error: e.error.clone(),
    })
  }

  /// Missing, invalidated, never fetched, or older than its freshness window.
  pub fn is_stale(&self, key: &CacheKey) -> bool {
    self
      .inner
      .state
      .lock()
      .entries
      .get(key)
      .map_or(true, Entry::is_stale)
  }

  /// Keys currently marked stale, sorted.
  pub fn stale_keys(&self) -> Vec<CacheKey> {
    let state = self.inner.state.lock();
    let mut keys: Vec<CacheKey> = state
      .entries
      .iter()
      .filter(|(_, e)| e.is_stale())
      .map(|(k, _)| k.clone())
      .collect();
    keys.sort();
    keys
  }

  pub fn keys(&self) -> Vec<CacheKey> {
    let mut keys: Vec<CacheKey> = self.inner.state.lock().entries.keys().cloned().collect();
    keys.sort();
    keys
  }

  pub fn len(&self) -> usize {
    self.inner.state.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Store server data for `key` as freshly fetched.
  pub fn set(&self, key: &CacheKey, data: Value, options: SetOptions) {
    let notifications = {
      let mut state = self.inner.state.lock();
      let version = state.tick();
      let default_stale = self.inner.options.stale_time;
      let entry = state
        .entries
        .entry(key.clone())
        .or_insert_with(|| Entry::blank(default_stale));
      if let Some(stale_after) = options.stale_after {
        entry.stale_after = stale_after;
      }
      entry.data = Some(data);
      entry.fetched_at = Some(Instant::now());
      entry.status = QueryStatus::Success;
      entry.invalidated = false;
      entry.error = None;
      entry.version = version;
      entry.last_access = Instant::now();
      collect(key, entry, CacheEventKind::Updated)
    };
    dispatch(notifications);
  }

  /// Modify existing data in place. Returns false if there is no data for `key`.
  pub fn patch(&self, key: &CacheKey, f: impl FnOnce(&mut Value)) -> bool {
    let notifications = {
      let mut state = self.inner.state.lock();
      let version = state.tick();
      let Some(entry) = state.entries.get_mut(key) else {
        return false;
      };
      let Some(data) = entry.data.as_mut() else {
        return false;
      };
      f(data);
      entry.version = version;
      collect(key, entry, CacheEventKind::Updated)
    };
    dispatch(notifications);
    true
  }

  /// Mark every matching entry stale. Nothing is deleted.
  ///
  /// Observed entries with a known fetcher are refetched in the background;
  /// the rest refetch on their next read. Returns the matched keys, sorted.
  pub fn invalidate(&self, filter: impl Into<KeyFilter>) -> Vec<CacheKey> {
    let filter = filter.into();
    let mut notifications = Vec::new();
    let mut refetch = Vec::new();

    let mut matched = {
      let mut state = self.inner.state.lock();
      let version = state.tick();
      let mut matched = Vec::new();
      for (key, entry) in state.entries.iter_mut() {
        if !filter.matches(key) {
          continue;
        }
        entry.invalidated = true;
        // Supersedes any fetch issued before now
        entry.version = version;
        entry.settle_loading();
        if let Some(handle) = entry.refetch.take() {
          handle.abort();
        }
        notifications.extend(collect(key, entry, CacheEventKind::Invalidated));
        if !entry.observers.is_empty() {
          if let Some(fetcher) = &entry.fetcher {
            refetch.push((key.clone(), fetcher.clone()));
          }
        }
        matched.push(key.clone());
      }
      matched
    };
    matched.sort();

    debug!(filter = %filter, matched = matched.len(), refetching = refetch.len(), "Invalidated cache entries");
    dispatch(notifications);

    for (key, fetcher) in refetch {
      self.spawn_refetch(key, fetcher);
    }
    matched
  }

  /// Drop an entry entirely, including its observers.
  pub fn remove(&self, key: &CacheKey) -> bool {
    let notifications = {
      let mut state = self.inner.state.lock();
      let Some(mut entry) = state.entries.remove(key) else {
        return false;
      };
      if let Some(handle) = entry.refetch.take() {
        handle.abort();
      }
      entry.status = QueryStatus::Idle;
      collect(key, &entry, CacheEventKind::Removed)
    };
    dispatch(notifications);
    true
  }

  pub fn clear(&self) {
    let keys = self.keys();
    for key in keys {
      self.remove(&key);
    }
  }

  /// Evict unobserved entries idle for longer than the GC window, then the
  /// least recently used unobserved entries above the size cap.
  pub fn sweep(&self) -> usize {
    let gc_time = self.inner.options.gc_time;
    let max_entries = self.inner.options.max_entries;

    let mut state = self.inner.state.lock();
    let before = state.entries.len();

    state
      .entries
      .retain(|_, e| !e.observers.is_empty() || e.last_access.elapsed() < gc_time);

    if state.entries.len() > max_entries {
      let mut idle: Vec<(CacheKey, Instant)> = state
        .entries
        .iter()
        .filter(|(_, e)| e.observers.is_empty())
        .map(|(k, e)| (k.clone(), e.last_access))
        .collect();
      idle.sort_by_key(|(_, at)| *at);

      let excess = state.entries.len() - max_entries;
      for (key, _) in idle.into_iter().take(excess) {
        state.entries.remove(&key);
      }
    }

    let evicted = before - state.entries.len();
    if evicted > 0 {
      debug!(evicted, remaining = state.entries.len(), "Swept cache");
    }
    evicted
  }

  /// Register an observer for `key`. Dropping the returned guard detaches it.
  pub fn subscribe(
    &self,
    key: &CacheKey,
    listener: impl Fn(&CacheEvent) + Send + Sync + 'static,
  ) -> Subscription {
    let mut state = self.inner.state.lock();
    state.next_observer += 1;
    let id = state.next_observer;
    let default_stale = self.inner.options.stale_time;
    let entry = state
      .entries
      .entry(key.clone())
      .or_insert_with(|| Entry::blank(default_stale));
    entry.observers.push((id, Arc::new(listener)));

    Subscription {
      store: Arc::downgrade(&self.inner),
      key: key.clone(),
      id,
    }
  }

  /// Read-through fetch with the store's default freshness window.
  pub async fn fetch_query<F, Fut>(&self, key: &CacheKey, fetcher: F) -> ApiResult<Value>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ApiResult<Value>> + Send + 'static,
  {
    self.fetch_query_with(key, SetOptions::default(), fetcher).await
  }

  /// Read-through fetch.
  ///
  /// 1. Fresh data is returned immediately
  /// 2. Otherwise the fetcher runs and its result replaces the entry
  /// 3. A result that arrives after a newer write is returned to the caller
  ///    but not written to the cache
  pub async fn fetch_query_with<F, Fut>(
    &self,
    key: &CacheKey,
    options: SetOptions,
    fetcher: F,
  ) -> ApiResult<Value>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ApiResult<Value>> + Send + 'static,
  {
    let fetcher: Fetcher =
      Arc::new(move || -> BoxFuture<'static, ApiResult<Value>> { Box::pin(fetcher()) });

    {
      let mut state = self.inner.state.lock();
      if let Some(entry) = state.entries.get_mut(key) {
        entry.fetcher = Some(fetcher.clone());
        if let Some(stale_after) = options.stale_after {
          entry.stale_after = stale_after;
        }
        if !entry.is_stale() {
          entry.last_access = Instant::now();
          trace!(key = %key, "Cache hit");
          if let Some(data) = entry.data.clone() {
            return Ok(data);
          }
        }
      }
    }

    self.run_fetch(key, fetcher, options.stale_after).await
  }

  async fn run_fetch(
    &self,
    key: &CacheKey,
    fetcher: Fetcher,
    stale_after: Option<Duration>,
  ) -> ApiResult<Value> {
    let (issued, notifications) = {
      let mut state = self.inner.state.lock();
      let default_stale = self.inner.options.stale_time;
      let entry = state
        .entries
        .entry(key.clone())
        .or_insert_with(|| Entry::blank(default_stale));
      entry.fetcher = Some(fetcher.clone());
      if let Some(stale_after) = stale_after {
        entry.stale_after = stale_after;
      }
      entry.status = QueryStatus::Loading;
      entry.last_access = Instant::now();
      (entry.version, collect(key, entry, CacheEventKind::StatusChanged))
    };
    dispatch(notifications);

    debug!(key = %key, "Fetching");
    let mut guard = LoadingGuard {
      store: self,
      key,
      issued,
      done: false,
    };
    let result = fetcher().await;
    guard.done = true;

    let notifications = {
      let mut state = self.inner.state.lock();
      let version = state.tick();
      match state.entries.get_mut(key) {
        Some(entry) if entry.version == issued => match &result {
          Ok(data) => {
            entry.data = Some(data.clone());
            entry.fetched_at = Some(Instant::now());
            entry.status = QueryStatus::Success;
            entry.invalidated = false;
            entry.error = None;
            entry.version = version;
            collect(key, entry, CacheEventKind::Updated)
          }
          Err(err) => {
            entry.status = QueryStatus::Error;
            entry.error = Some(err.clone());
            collect(key, entry, CacheEventKind::StatusChanged)
          }
        },
        Some(entry) => {
          debug!(key = %key, "Discarding superseded fetch result");
          entry.settle_loading();
          collect(key, entry, CacheEventKind::StatusChanged)
        }
        None => Vec::new(),
      }
    };
    dispatch(notifications);

    result
  }

  fn spawn_refetch(&self, key: CacheKey, fetcher: Fetcher) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      debug!(key = %key, "No runtime, deferring refetch to next read");
      return;
    };

    let store = self.clone();
    let task_key = key.clone();
    let handle = runtime.spawn(async move {
      if let Err(e) = store.run_fetch(&task_key, fetcher, None).await {
        debug!(key = %task_key, error = %e, "Background refetch failed");
      }
    });

    let mut state = self.inner.state.lock();
    match state.entries.get_mut(&key) {
      Some(entry) => entry.refetch = Some(handle.abort_handle()),
      None => handle.abort(),
    }
  }

  /// Apply several writes under one lock, returning a snapshot per key taken
  /// before its first write.
  pub(crate) fn apply_updates(
    &self,
    updates: Vec<(CacheKey, UpdateFn)>,
  ) -> Vec<(CacheKey, EntrySnapshot)> {
    let mut notifications = Vec::new();

    let snapshots = {
      let mut state = self.inner.state.lock();
      let version = state.tick();
      let default_stale = self.inner.options.stale_time;
      let mut snapshots: Vec<(CacheKey, EntrySnapshot)> = Vec::new();

      for (key, update) in updates {
        if !snapshots.iter().any(|(k, _)| *k == key) {
          let snapshot = state
            .entries
            .get(&key)
            .map_or_else(|| EntrySnapshot::absent(default_stale), Entry::snapshot);
          snapshots.push((key.clone(), snapshot));
        }

        let entry = state
          .entries
          .entry(key.clone())
          .or_insert_with(|| Entry::blank(default_stale));
        entry.data = update(entry.data.as_ref());
        entry.status = if entry.data.is_some() {
          QueryStatus::Success
        } else {
          QueryStatus::Idle
        };
        entry.version = version;
        notifications.extend(collect(&key, entry, CacheEventKind::Updated));
      }
      snapshots
    };

    dispatch(notifications);
    snapshots
  }

  /// Put entries back exactly as captured, last write first.
  pub(crate) fn restore(&self, snapshots: &[(CacheKey, EntrySnapshot)]) {
    let mut notifications = Vec::new();
    {
      let mut state = self.inner.state.lock();
      let version = state.tick();
      for (key, snapshot) in snapshots.iter().rev() {
        if !snapshot.present {
          let observed = state
            .entries
            .get(key)
            .is_some_and(|e| !e.observers.is_empty());
          if !observed {
            if let Some(entry) = state.entries.remove(key) {
              notifications.extend(collect(key, &entry, CacheEventKind::Removed));
            }
            continue;
          }
        }

        let default_stale = self.inner.options.stale_time;
        let entry = state
          .entries
          .entry(key.clone())
          .or_insert_with(|| Entry::blank(default_stale));
        entry.data = snapshot.data.clone();
        entry.fetched_at = snapshot.fetched_at;
        entry.stale_after = snapshot.stale_after;
        entry.status = snapshot.status;
        entry.invalidated = snapshot.invalidated;
        entry.error = snapshot.error.clone();
        entry.version = version;
        notifications.extend(collect(key, entry, CacheEventKind::Updated));
      }
    }
    dispatch(notifications);
  }

  fn unsubscribe(inner: &Inner, key: &CacheKey, id: u64) {
    let mut state = inner.state.lock();
    if let Some(entry) = state.entries.get_mut(key) {
      entry.observers.retain(|(observer, _)| *observer != id);
      if entry.observers.is_empty() {
        // Nobody is looking any more
        if let Some(handle) = entry.refetch.take() {
          handle.abort();
        }
        entry.settle_loading();
        entry.last_access = Instant::now();
      }
    }
  }
}

impl EntrySnapshot {
  fn absent(stale_after: Duration) -> Self {
    Self {
      present: false,
      data: None,
      fetched_at: None,
      stale_after,
      status: QueryStatus::Idle,
      invalidated: false,
      error: None,
    }
  }

  pub(crate) fn data(&self) -> Option<&Value> {
    self.data.as_ref()
  }
}

/// Resets a `Loading` status if the fetch future is dropped before completing.
struct LoadingGuard<'a> {
  store: &'a CacheStore,
  key: &'a CacheKey,
  issued: u64,
  done: bool,
}

impl Drop for LoadingGuard<'_> {
  fn drop(&mut self) {
    if self.done {
      return;
    }
    let mut state = self.store.inner.state.lock();
    if let Some(entry) = state.entries.get_mut(self.key) {
      if entry.version == self.issued {
        entry.settle_loading();
      }
    }
  }
}

/// Observer registration. Detaches on drop.
pub struct Subscription {
  store: Weak<Inner>,
  key: CacheKey,
  id: u64,
}

impl Subscription {
  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// Detach now.
  pub fn unsubscribe(self) {
    // Drop does the work
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(inner) = self.store.upgrade() {
      CacheStore::unsubscribe(&inner, &self.key, self.id);
    }
  }
}

fn collect(key: &CacheKey, entry: &Entry, kind: CacheEventKind) -> Notifications {
  if entry.observers.is_empty() {
    return Vec::new();
  }
  let event = CacheEvent {
    key: key.clone(),
    kind,
    status: entry.status,
  };
  entry
    .observers
    .iter()
    .map(|(_, listener)| (listener.clone(), event.clone()))
    .collect()
}

fn dispatch(notifications: Notifications) {
  for (listener, event) in notifications {
    listener(&event);
  }
}
