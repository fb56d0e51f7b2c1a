//! Optimistic writes with exact rollback.
//!
//! Every write path shares the same sequence: snapshot the affected entries,
//! patch the cache synchronously, run the request, then either commit and
//! invalidate dependents or restore the snapshots.

use serde_json::Value;
use std::future::Future;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{CacheKey, CacheStore, EntrySnapshot, ListShape, UpdateFn};
use crate::error::ApiResult;
use crate::invalidation::{InvalidationDispatcher, MutationKind, RelatedIds, Resource};

/// One cache write that is part of an optimistic mutation.
pub struct OptimisticUpdate {
  key: CacheKey,
  f: UpdateFn,
}

impl OptimisticUpdate {
  /// Replace the entry's data with whatever `f` returns; `None` clears it.
  pub fn new(
    key: CacheKey,
    f: impl FnOnce(Option<&Value>) -> Option<Value> + Send + 'static,
  ) -> Self {
    Self {
      key,
      f: Box::new(f),
    }
  }

  pub fn replace(key: CacheKey, value: Value) -> Self {
    Self::new(key, move |_| Some(value))
  }

  /// Edit existing data in place. A missing entry stays missing.
  pub fn patch(key: CacheKey, f: impl FnOnce(&mut Value) + Send + 'static) -> Self {
    Self::new(key, move |current| {
      current.cloned().map(|mut data| {
        f(&mut data);
        data
      })
    })
  }

  pub fn list_insert(key: CacheKey, shape: ListShape, position: usize, item: Value) -> Self {
    Self::patch(key, move |list| {
      shape.insert_at(list, position, item);
    })
  }

  pub fn list_patch(
    key: CacheKey,
    shape: ListShape,
    id: impl Into<String>,
    f: impl FnOnce(&mut Value) + Send + 'static,
  ) -> Self {
    let id = id.into();
    Self::patch(key, move |list| {
      shape.patch_by_id(list, &id, f);
    })
  }

  pub fn list_remove(key: CacheKey, shape: ListShape, id: impl Into<String>) -> Self {
    let id = id.into();
    Self::patch(key, move |list| {
      shape.remove_by_id(list, &id);
    })
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }
}

/// What a mutation did, for invalidation once it succeeds.
#[derive(Debug, Clone)]
pub struct MutationSpec {
  pub resource: Resource,
  pub kind: MutationKind,
  pub resource_id: Option<String>,
  pub related: RelatedIds,
}

impl MutationSpec {
  pub fn create(resource: Resource) -> Self {
    Self {
      resource,
      kind: MutationKind::Create,
      resource_id: None,
      related: RelatedIds::default(),
    }
  }

  pub fn update(resource: Resource, id: impl Into<String>) -> Self {
    Self {
      resource,
      kind: MutationKind::Update,
      resource_id: Some(id.into()),
      related: RelatedIds::default(),
    }
  }

  pub fn delete(resource: Resource, id: impl Into<String>) -> Self {
    Self {
      resource,
      kind: MutationKind::Delete,
      resource_id: Some(id.into()),
      related: RelatedIds::default(),
    }
  }

  pub fn with_related(mut self, related: RelatedIds) -> Self {
    self.related = related;
    self
  }
}

/// An applied optimistic write awaiting its outcome.
///
/// Either [`commit`](Self::commit) or [`rollback`](Self::rollback) settles it.
/// Dropping it unsettled rolls back.
pub struct PendingMutation {
  id: Uuid,
  snapshots: Vec<(CacheKey, EntrySnapshot)>,
  cache: CacheStore,
  settled: bool,
}

impl PendingMutation {
  pub fn id(&self) -> Uuid {
    self.id
  }

  pub fn keys(&self) -> Vec<&CacheKey> {
    self.snapshots.iter().map(|(key, _)| key).collect()
  }

  /// Data held by `key` before this mutation.
  pub fn previous(&self, key: &CacheKey) -> Option<&Value> {
    self
      .snapshots
      .iter()
      .find(|(k, _)| k == key)
      .and_then(|(_, snapshot)| snapshot.data())
  }

  /// Keep the optimistic data and discard the snapshots.
  pub fn commit(mut self) {
    self.settled = true;
    debug!(mutation = %self.id, keys = self.snapshots.len(), "Committed optimistic update");
  }

  /// Restore every affected entry to its pre-mutation state.
  pub fn rollback(mut self) {
    self.restore();
  }

  fn restore(&mut self) {
    self.settled = true;
    self.cache.restore(&self.snapshots);
    debug!(mutation = %self.id, keys = self.snapshots.len(), "Rolled back optimistic update");
  }
}

impl Drop for PendingMutation {
  fn drop(&mut self) {
    if !self.settled {
      warn!(mutation = %self.id, "Optimistic update dropped unsettled, rolling back");
      self.restore();
    }
  }
}

/// Applies optimistic writes to the cache and settles them.
#[derive(Clone)]
pub struct OptimisticEngine {
  cache: CacheStore,
  dispatcher: InvalidationDispatcher,
}

impl OptimisticEngine {
  pub fn new(cache: CacheStore, dispatcher: InvalidationDispatcher) -> Self {
    Self { cache, dispatcher }
  }

  pub fn cache(&self) -> &CacheStore {
    &self.cache
  }

  pub fn dispatcher(&self) -> &InvalidationDispatcher {
    &self.dispatcher
  }

  pub fn perform_update(
    &self,
    key: &CacheKey,
    f: impl FnOnce(Option<&Value>) -> Option<Value> + Send + 'static,
  ) -> PendingMutation {
    self.perform_batch(vec![OptimisticUpdate::new(key.clone(), f)])
  }

  /// Apply all updates as one step. Rolling back restores every key.
  pub fn perform_batch(&self, updates: Vec<OptimisticUpdate>) -> PendingMutation {
    let updates = updates.into_iter().map(|u| (u.key, u.f)).collect();
    let snapshots = self.cache.apply_updates(updates);
    let pending = PendingMutation {
      id: Uuid::new_v4(),
      snapshots,
      cache: self.cache.clone(),
      settled: false,
    };
    debug!(mutation = %pending.id, keys = pending.snapshots.len(), "Applied optimistic update");
    pending
  }

  pub fn insert_into_list(
    &self,
    key: &CacheKey,
    shape: ListShape,
    position: usize,
    item: Value,
  ) -> PendingMutation {
    self.perform_batch(vec![OptimisticUpdate::list_insert(key.clone(), shape, position, item)])
  }

  pub fn patch_in_list(
    &self,
    key: &CacheKey,
    shape: ListShape,
    id: &str,
    f: impl FnOnce(&mut Value) + Send + 'static,
  ) -> PendingMutation {
    self.perform_batch(vec![OptimisticUpdate::list_patch(key.clone(), shape, id, f)])
  }

  pub fn remove_from_list(&self, key: &CacheKey, shape: ListShape, id: &str) -> PendingMutation {
    self.perform_batch(vec![OptimisticUpdate::list_remove(key.clone(), shape, id)])
  }

  /// Run `request` with `updates` applied optimistically.
  ///
  /// On success the updates stay and dependents are invalidated. On any error
  /// the cache is restored before the error is returned.
  pub async fn mutate<Fut>(
    &self,
    spec: &MutationSpec,
    updates: Vec<OptimisticUpdate>,
    request: Fut,
  ) -> ApiResult<Value>
  where
    Fut: Future<Output = ApiResult<Value>>,
  {
    let pending = self.perform_batch(updates);

    match request.await {
      Ok(data) => {
        pending.commit();
        self.dispatcher.on_mutation_settled(
          spec.resource,
          spec.kind,
          spec.resource_id.as_deref(),
          &spec.related,
        );
        Ok(data)
      }
      Err(err) => {
        pending.rollback();
        debug!(resource = %spec.resource, kind = %spec.kind, error = %err, "Mutation failed");
        Err(err)
      }
    }
  }
}
