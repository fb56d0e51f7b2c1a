//! Durable FIFO log of mutations made while offline.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use parking_lot::Mutex;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult, ErrorKind};
use crate::invalidation::{InvalidationDispatcher, MutationKind, RelatedIds, Resource};
use crate::storage::{keys, PersistentStore};
use crate::transport::{RequestOptions, Transport};

/// Replay attempts before an action is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
  Create,
  Update,
  Delete,
}

impl ActionType {
  pub fn method(&self) -> Method {
    match self {
      ActionType::Create => Method::POST,
      ActionType::Update => Method::PUT,
      ActionType::Delete => Method::DELETE,
    }
  }

  pub fn kind(&self) -> MutationKind {
    match self {
      ActionType::Create => MutationKind::Create,
      ActionType::Update => MutationKind::Update,
      ActionType::Delete => MutationKind::Delete,
    }
  }
}

impl From<MutationKind> for ActionType {
  fn from(kind: MutationKind) -> Self {
    match kind {
      MutationKind::Create => ActionType::Create,
      MutationKind::Update => ActionType::Update,
      MutationKind::Delete => ActionType::Delete,
    }
  }
}

/// One queued mutation, in its persisted form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineAction {
  pub id: String,
  #[serde(rename = "type")]
  pub action_type: ActionType,
  pub resource: Resource,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub resource_id: Option<String>,
  #[serde(default)]
  pub payload: Value,
  pub enqueued_at: DateTime<Utc>,
  pub retry_count: u32,
  pub max_retries: u32,
  #[serde(default)]
  pub related: RelatedIds,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
}

impl OfflineAction {
  pub fn new(
    action_type: ActionType,
    resource: Resource,
    resource_id: Option<String>,
    payload: Value,
  ) -> Self {
    Self {
      id: Uuid::new_v4().to_string(),
      action_type,
      resource,
      resource_id,
      payload,
      enqueued_at: Utc::now(),
      retry_count: 0,
      max_retries: DEFAULT_MAX_RETRIES,
      related: RelatedIds::default(),
      last_error: None,
    }
  }

  pub fn create(resource: Resource, payload: Value) -> Self {
    Self::new(ActionType::Create, resource, None, payload)
  }

  pub fn update(resource: Resource, id: impl Into<String>, payload: Value) -> Self {
    Self::new(ActionType::Update, resource, Some(id.into()), payload)
  }

  pub fn delete(resource: Resource, id: impl Into<String>) -> Self {
    Self::new(ActionType::Delete, resource, Some(id.into()), Value::Null)
  }

  pub fn with_related(mut self, related: RelatedIds) -> Self {
    self.related = related;
    self
  }

  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries;
    self
  }

  pub fn is_exhausted(&self) -> bool {
    self.retry_count >= self.max_retries
  }

  /// `POST /resource`, `PUT /resource/id` or `DELETE /resource/id`
  pub fn request_path(&self) -> ApiResult<String> {
    match (self.action_type, &self.resource_id) {
      (ActionType::Create, _) => Ok(self.resource.path()),
      (_, Some(id)) => Ok(self.resource.item_path(id)),
      (_, None) => {
        let mut err = ApiError::new(ErrorKind::Validation);
        err.message = format!("{} {} has no resource id", self.action_type.method(), self.resource);
        Err(err)
      }
    }
  }
}

/// A queued action that will not be replayed again.
#[derive(Debug, Clone)]
pub struct FailedAction {
  pub action: OfflineAction,
  pub error: ApiError,
}

/// Outcome of one drain.
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
  /// Another drain was already running; nothing was done
  pub skipped: bool,
  /// Ids of actions replayed successfully, in order
  pub replayed: Vec<String>,
  /// Actions removed after a terminal failure or their last retry
  pub failed: Vec<FailedAction>,
  /// Actions still queued afterwards
  pub remaining: usize,
}

impl DrainReport {
  fn skipped() -> Self {
    Self {
      skipped: true,
      ..Self::default()
    }
  }
}

/// Queue notifications for the application shell.
#[derive(Debug, Clone)]
pub enum QueueEvent {
  Enqueued { id: String, resource: Resource },
  Replayed { id: String, resource: Resource },
  /// Replay failed while offline; the action stays at the head of the queue
  Retrying { id: String, retry_count: u32 },
  PermanentlyFailed(FailedAction),
  Drained { replayed: usize, failed: usize, remaining: usize },
}

struct Inner {
  storage: Arc<dyn PersistentStore>,
  transport: Transport,
  dispatcher: InvalidationDispatcher,
  actions: Mutex<VecDeque<OfflineAction>>,
  /// Serializes writers. Held across storage writes; `actions` never is.
  writer: Mutex<()>,
  draining: watch::Sender<bool>,
  events: broadcast::Sender<QueueEvent>,
}

/// Offline action queue. Cheap to clone.
///
/// Every change is written through to storage before it is visible in memory,
/// so the persisted list is always the full queue. Replay outcomes are the
/// exception: they are kept in memory even when the write fails.
#[derive(Clone)]
pub struct OfflineQueue {
  inner: Arc<Inner>,
}

impl OfflineQueue {
  /// Create an empty queue. Call [`load`](Self::load) to restore persisted actions.
  pub fn new(
    storage: Arc<dyn PersistentStore>,
    transport: Transport,
    dispatcher: InvalidationDispatcher,
  ) -> Self {
    let (events, _) = broadcast::channel(64);
    let (draining, _) = watch::channel(false);
    Self {
      inner: Arc::new(Inner {
        storage,
        transport,
        dispatcher,
        actions: Mutex::new(VecDeque::new()),
        writer: Mutex::new(()),
        draining,
        events,
      }),
    }
  }

  /// Replace the in-memory queue with the persisted one.
  pub fn load(&self) -> Result<usize> {
    let actions: VecDeque<OfflineAction> = match self.inner.storage.load(keys::OFFLINE_QUEUE)? {
      Some(json) => serde_json::from_str(&json)
        .map_err(|e| eyre!("Failed to parse persisted offline queue: {}", e))?,
      None => VecDeque::new(),
    };

    let count = actions.len();
    *self.inner.actions.lock() = actions;
    debug!(count, "Loaded offline queue");
    Ok(count)
  }

  pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
    self.inner.events.subscribe()
  }

  pub fn pending(&self) -> Vec<OfflineAction> {
    self.inner.actions.lock().iter().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.inner.actions.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn is_draining(&self) -> bool {
    *self.inner.draining.borrow()
  }

  /// Wait until no drain is running.
  pub async fn wait_idle(&self) {
    let mut rx = self.inner.draining.subscribe();
    // `inner` owns the sender, so the channel stays open
    let _ = rx.wait_for(|draining| !*draining).await;
  }

  /// Persist `action` at the tail of the queue.
  pub fn enqueue(&self, action: OfflineAction) -> Result<()> {
    let id = action.id.clone();
    let resource = action.resource;
    self.update(|actions| actions.push_back(action))?;

    info!(id = %id, resource = %resource, "Queued offline action");
    self.emit(QueueEvent::Enqueued { id, resource });
    Ok(())
  }

  pub fn clear(&self) -> Result<()> {
    let dropped = self.update(|actions| {
      let n = actions.len();
      actions.clear();
      n
    })?;
    if dropped > 0 {
      warn!(dropped, "Cleared offline queue");
    }
    Ok(())
  }

  /// Replay queued actions in order.
  ///
  /// Stops at the first action that fails because the server is unreachable,
  /// leaving it at the head. Actions that fail for any other reason are
  /// dropped and reported. Calling this while a drain is running does nothing.
  pub async fn drain(&self) -> Result<DrainReport> {
    let started = self.inner.draining.send_if_modified(|draining| {
      if *draining {
        return false;
      }
      *draining = true;
      true
    });
    if !started {
      debug!("Drain already running");
      return Ok(DrainReport::skipped());
    }
    let _guard = DrainGuard(&self.inner.draining);

    let mut report = DrainReport::default();

    loop {
      let Some(action) = self.inner.actions.lock().front().cloned() else {
        break;
      };

      match self.replay(&action).await {
        Ok(data) => {
          // The server has it; never send it again even if storage lags
          self.settle(|actions| actions.retain(|a| a.id != action.id));

          // A create only learns its id from the server
          let created_id = data.get("id").and_then(|id| match id {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
          });
          let resource_id = action.resource_id.clone().or(created_id);
          self.inner.dispatcher.on_mutation_settled(
            action.resource,
            action.action_type.kind(),
            resource_id.as_deref(),
            &action.related,
          );

          info!(id = %action.id, resource = %action.resource, "Replayed offline action");
          report.replayed.push(action.id.clone());
          self.emit(QueueEvent::Replayed {
            id: action.id,
            resource: action.resource,
          });
        }
        Err(error) => {
          let offline = error.is_offline();
          let failed = self.record_failure(&action.id, &error, !offline);

          match failed {
            Some(failed) => {
              warn!(
                id = %failed.action.id,
                resource = %failed.action.resource,
                retry_count = failed.action.retry_count,
                error = %failed.error,
                "Offline action permanently failed"
              );
              report.failed.push(failed.clone());
              self.emit(QueueEvent::PermanentlyFailed(failed));
            }
            None => {
              let retry_count = action.retry_count + 1;
              debug!(id = %action.id, retry_count, error = %error, "Offline action will retry");
              self.emit(QueueEvent::Retrying {
                id: action.id,
                retry_count,
              });
            }
          }

          if offline {
            break;
          }
        }
      }
    }

    report.remaining = self.len();
    self.emit(QueueEvent::Drained {
      replayed: report.replayed.len(),
      failed: report.failed.len(),
      remaining: report.remaining,
    });
    Ok(report)
  }

  async fn replay(&self, action: &OfflineAction) -> ApiResult<Value> {
    let path = action.request_path()?;
    let method = action.action_type.method();
    let body = match action.action_type {
      ActionType::Delete => None,
      _ => Some(&action.payload),
    };
    // Each drain is one attempt; the queue does its own bounded retry
    let options = RequestOptions {
      skip_retry: true,
      ..RequestOptions::default()
    };

    debug!(id = %action.id, %method, path = %path, "Replaying offline action");
    self
      .inner
      .transport
      .request(method, &path, body, &options)
      .await
      .map(|payload| payload.data)
  }

  /// Count a failed replay. Returns the action if it has left the queue.
  fn record_failure(&self, id: &str, error: &ApiError, terminal: bool) -> Option<FailedAction> {
    self.settle(|actions| -> Option<FailedAction> {
      let index = actions.iter().position(|a| a.id == id)?;
      let action = &mut actions[index];
      action.retry_count = if terminal {
        action.max_retries
      } else {
        action.retry_count + 1
      };
      action.last_error = Some(error.to_string());

      if action.is_exhausted() {
        let action = actions.remove(index)?;
        Some(FailedAction {
          action,
          error: error.clone(),
        })
      } else {
        None
      }
    })
  }

  /// Apply `f` to a copy of the queue, persist the copy, then publish it.
  /// Nothing changes if the write fails.
  fn update<R>(&self, f: impl FnOnce(&mut VecDeque<OfflineAction>) -> R) -> Result<R> {
    let _writer = self.inner.writer.lock();
    let mut next = self.inner.actions.lock().clone();
    let result = f(&mut next);

    self.persist(&next)?;
    *self.inner.actions.lock() = next;
    Ok(result)
  }

  /// Like [`update`](Self::update), but the change is published even when
  /// it cannot be persisted.
  fn settle<R>(&self, f: impl FnOnce(&mut VecDeque<OfflineAction>) -> R) -> R {
    let _writer = self.inner.writer.lock();
    let mut next = self.inner.actions.lock().clone();
    let result = f(&mut next);

    if let Err(e) = self.persist(&next) {
      warn!(error = %e, pending = next.len(), "Failed to persist offline queue");
    }
    *self.inner.actions.lock() = next;
    result
  }

  fn persist(&self, actions: &VecDeque<OfflineAction>) -> Result<()> {
    if actions.is_empty() {
      return self.inner.storage.remove(keys::OFFLINE_QUEUE);
    }
    let json = serde_json::to_string(actions)
      .map_err(|e| eyre!("Failed to serialize offline queue: {}", e))?;
    self.inner.storage.save(keys::OFFLINE_QUEUE, &json)
  }

  fn emit(&self, event: QueueEvent) {
    // No subscribers is fine
    let _ = self.inner.events.send(event);
  }
}

struct DrainGuard<'a>(&'a watch::Sender<bool>);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.send_replace(false);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheKey, CacheStore, SetOptions};
  use crate::credentials::{CredentialPair, CredentialStore};
  use crate::storage::{MemoryStore, SqliteStore};
  use crate::transport::testing::{Reply, ScriptedBackend};
  use crate::transport::RetryPolicy;
  use serde_json::json;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
  use std::time::Duration;

  /// Memory store whose writes can be made to fail. `on_save` runs inside
  /// every save.
  #[derive(Default)]
  struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
    on_save: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
  }

  impl PersistentStore for FlakyStore {
    fn load(&self, key: &str) -> Result<Option<String>> {
      self.inner.load(key)
    }

    fn save(&self, key: &str, value: &str) -> Result<()> {
      if let Some(hook) = self.on_save.lock().as_ref() {
        hook();
      }
      if self.failing.load(Ordering::SeqCst) {
        return Err(eyre!("disk full"));
      }
      self.inner.save(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
      if self.failing.load(Ordering::SeqCst) {
        return Err(eyre!("disk full"));
      }
      self.inner.remove(key)
    }
  }

  struct Harness {
    queue: OfflineQueue,
    cache: CacheStore,
    storage: Arc<dyn PersistentStore>,
  }

  fn harness(backend: Arc<ScriptedBackend>, storage: Arc<dyn PersistentStore>) -> Harness {
    let credentials = CredentialStore::new(storage.clone());
    credentials
      .install(CredentialPair {
        access_token: "token".to_string(),
        refresh_token: "refresh".to_string(),
      })
      .unwrap();
    let transport = Transport::new(backend, credentials, RetryPolicy::none(), Duration::from_secs(5));
    let cache = CacheStore::default();
    let queue = OfflineQueue::new(
      storage.clone(),
      transport,
      InvalidationDispatcher::new(cache.clone()),
    );
    Harness {
      queue,
      cache,
      storage,
    }
  }

  fn persisted(storage: &Arc<dyn PersistentStore>) -> Vec<OfflineAction> {
    storage
      .load(keys::OFFLINE_QUEUE)
      .unwrap()
      .map(|json| serde_json::from_str(&json).unwrap())
      .unwrap_or_default()
  }

  #[tokio::test]
  async fn test_enqueue_persists_before_replay() {
    let backend = ScriptedBackend::new(|_| Reply::with_status(201, json!({"id": "C1"})));
    let h = harness(backend, Arc::new(MemoryStore::new()));

    h.queue
      .enqueue(OfflineAction::create(Resource::Customers, json!({"name": "Acme"})))
      .unwrap();

    let stored = persisted(&h.storage);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].action_type, ActionType::Create);
    assert_eq!(stored[0].retry_count, 0);
    assert_eq!(stored[0].max_retries, 3);
  }

  #[tokio::test]
  async fn test_drain_replays_in_fifo_order() {
    let backend = ScriptedBackend::new(|_| Reply::ok(json!({})));
    let h = harness(backend.clone(), Arc::new(MemoryStore::new()));

    h.queue
      .enqueue(OfflineAction::create(Resource::Quotations, json!({"n": 1})))
      .unwrap();
    h.queue
      .enqueue(OfflineAction::update(Resource::Quotations, "Q1", json!({"n": 2})))
      .unwrap();
    h.queue.enqueue(OfflineAction::delete(Resource::Orders, "O7")).unwrap();

    let report = h.queue.drain().await.unwrap();

    assert_eq!(report.replayed.len(), 3);
    assert_eq!(report.remaining, 0);
    let calls: Vec<(Method, String)> = backend
      .requests()
      .into_iter()
      .map(|r| (r.method, r.path))
      .collect();
    assert_eq!(
      calls,
      vec![
        (Method::POST, "/quotations".to_string()),
        (Method::PUT, "/quotations/Q1".to_string()),
        (Method::DELETE, "/orders/O7".to_string()),
      ]
    );
    assert_eq!(backend.requests()[2].body, None);
    assert!(persisted(&h.storage).is_empty());
  }

  #[tokio::test]
  async fn test_action_dropped_after_max_network_failures() {
    let backend = ScriptedBackend::new(|_| Reply::connection_refused());
    let h = harness(backend, Arc::new(MemoryStore::new()));
    h.queue
      .enqueue(OfflineAction::update(Resource::Orders, "O1", json!({"qty": 2})))
      .unwrap();

    for expected in 1..=2 {
      let report = h.queue.drain().await.unwrap();
      assert!(report.failed.is_empty());
      assert_eq!(report.remaining, 1);
      assert_eq!(persisted(&h.storage)[0].retry_count, expected);
    }

    let report = h.queue.drain().await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].action.retry_count, 3);
    assert_eq!(report.failed[0].error.kind, ErrorKind::Network);
    assert!(h.queue.is_empty());
    assert!(persisted(&h.storage).is_empty());
  }

  #[tokio::test]
  async fn test_action_succeeding_on_last_retry_is_not_reported() {
    let calls = Arc::new(AtomicUsize::new(0));
    let backend = {
      let calls = calls.clone();
      ScriptedBackend::new(move |_| {
        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
          Reply::connection_refused()
        } else {
          Reply::ok(json!({}))
        }
      })
    };
    let h = harness(backend, Arc::new(MemoryStore::new()));
    let mut events = h.queue.subscribe();
    h.queue
      .enqueue(OfflineAction::delete(Resource::Customers, "C1"))
      .unwrap();

    h.queue.drain().await.unwrap();
    h.queue.drain().await.unwrap();
    let report = h.queue.drain().await.unwrap();

    assert_eq!(report.replayed.len(), 1);
    assert!(report.failed.is_empty());
    assert!(h.queue.is_empty());

    let mut permanently_failed = 0;
    while let Ok(event) = events.try_recv() {
      if matches!(event, QueueEvent::PermanentlyFailed(_)) {
        permanently_failed += 1;
      }
    }
    assert_eq!(permanently_failed, 0);
  }

  #[tokio::test]
  async fn test_non_network_failure_is_terminal_and_drain_continues() {
    let backend = ScriptedBackend::new(|req| {
      if req.path == "/orders" {
        Reply::error(400)
      } else {
        Reply::ok(json!({}))
      }
    });
    let h = harness(backend, Arc::new(MemoryStore::new()));
    h.queue
      .enqueue(OfflineAction::create(Resource::Orders, json!({})))
      .unwrap();
    h.queue
      .enqueue(OfflineAction::create(Resource::Customers, json!({})))
      .unwrap();

    let report = h.queue.drain().await.unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].error.kind, ErrorKind::Validation);
    assert_eq!(report.failed[0].action.retry_count, 3);
    assert_eq!(report.replayed.len(), 1);
    assert!(h.queue.is_empty());
  }

  #[tokio::test]
  async fn test_network_failure_keeps_later_actions_queued() {
    let backend = ScriptedBackend::new(|_| Reply::connection_refused());
    let h = harness(backend.clone(), Arc::new(MemoryStore::new()));
    let first = OfflineAction::create(Resource::Orders, json!({"n": 1}));
    let second = OfflineAction::create(Resource::Orders, json!({"n": 2}));
    h.queue.enqueue(first.clone()).unwrap();
    h.queue.enqueue(second.clone()).unwrap();

    h.queue.drain().await.unwrap();

    assert_eq!(backend.requests().len(), 1);
    let ids: Vec<String> = h.queue.pending().into_iter().map(|a| a.id).collect();
    assert_eq!(ids, vec![first.id, second.id]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_drain_is_skipped() {
    let backend = ScriptedBackend::new(|_| Reply::ok(json!({})).after(Duration::from_secs(1)));
    let h = harness(backend.clone(), Arc::new(MemoryStore::new()));
    h.queue
      .enqueue(OfflineAction::create(Resource::Products, json!({})))
      .unwrap();

    let running = {
      let queue = h.queue.clone();
      tokio::spawn(async move { queue.drain().await })
    };
    tokio::task::yield_now().await;
    assert!(h.queue.is_draining());

    let second = h.queue.drain().await.unwrap();
    assert!(second.skipped);

    let first = running.await.unwrap().unwrap();
    assert_eq!(first.replayed.len(), 1);
    assert_eq!(backend.requests().len(), 1);
    assert!(!h.queue.is_draining());
  }

  #[tokio::test]
  async fn test_replay_invalidates_related_queries() {
    let backend = ScriptedBackend::new(|_| Reply::with_status(201, json!({"id": "O5"})));
    let h = harness(backend, Arc::new(MemoryStore::new()));
    let quotation = CacheKey::detail("quotations", "Q1");
    let orders = CacheKey::list("orders");
    h.cache.set(&quotation, json!({}), SetOptions::default());
    h.cache.set(&orders, json!([]), SetOptions::default());

    h.queue
      .enqueue(
        OfflineAction::create(Resource::Orders, json!({"quotationId": "Q1"}))
          .with_related(RelatedIds::quotation("Q1")),
      )
      .unwrap();
    h.queue.drain().await.unwrap();

    assert!(h.cache.is_stale(&quotation));
    assert!(h.cache.is_stale(&orders));
  }

  #[tokio::test]
  async fn test_queue_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");
    let backend = ScriptedBackend::new(|_| Reply::connection_refused());

    let action = OfflineAction::update(Resource::Customers, "C1", json!({"name": "Acme"}));
    {
      let h = harness(backend.clone(), Arc::new(SqliteStore::open(&path).unwrap()));
      h.queue.enqueue(action.clone()).unwrap();
      h.queue.drain().await.unwrap();
    }

    let h = harness(backend, Arc::new(SqliteStore::open(&path).unwrap()));
    assert!(h.queue.is_empty());
    assert_eq!(h.queue.load().unwrap(), 1);

    let restored = &h.queue.pending()[0];
    assert_eq!(restored.id, action.id);
    assert_eq!(restored.payload, action.payload);
    assert_eq!(restored.enqueued_at, action.enqueued_at);
    assert_eq!(restored.retry_count, 1);
    assert!(restored.last_error.is_some());
  }

  #[tokio::test]
  async fn test_acknowledged_replay_leaves_queue_when_storage_fails() {
    let backend = ScriptedBackend::new(|_| Reply::ok(json!({})));
    let store = Arc::new(FlakyStore::default());
    let h = harness(backend.clone(), store.clone());
    let orders = CacheKey::list("orders");
    h.cache.set(&orders, json!([]), SetOptions::default());
    h.queue
      .enqueue(OfflineAction::update(Resource::Orders, "O1", json!({"v": 1})))
      .unwrap();
    h.queue.enqueue(OfflineAction::delete(Resource::Orders, "O2")).unwrap();
    let mut events = h.queue.subscribe();

    store.failing.store(true, Ordering::SeqCst);
    let report = h.queue.drain().await.unwrap();

    assert_eq!(report.replayed.len(), 2);
    assert_eq!(report.remaining, 0);
    assert!(h.queue.is_empty());
    assert!(h.cache.is_stale(&orders));
    let mut drained = false;
    while let Ok(event) = events.try_recv() {
      drained |= matches!(event, QueueEvent::Drained { replayed: 2, .. });
    }
    assert!(drained);

    h.queue.drain().await.unwrap();
    assert_eq!(backend.requests().len(), 2);

    // New actions still require a durable write
    assert!(h
      .queue
      .enqueue(OfflineAction::delete(Resource::Orders, "O3"))
      .is_err());
    assert!(h.queue.is_empty());
  }

  #[tokio::test]
  async fn test_failed_replay_counted_when_storage_fails() {
    let backend = ScriptedBackend::new(|_| Reply::connection_refused());
    let store = Arc::new(FlakyStore::default());
    let h = harness(backend, store.clone());
    h.queue
      .enqueue(OfflineAction::create(Resource::Quotations, json!({})))
      .unwrap();

    store.failing.store(true, Ordering::SeqCst);
    let report = h.queue.drain().await.unwrap();

    assert_eq!(report.remaining, 1);
    assert_eq!(h.queue.pending()[0].retry_count, 1);
    assert!(!h.queue.is_draining());
  }

  #[tokio::test]
  async fn test_queue_readable_during_storage_write() {
    let backend = ScriptedBackend::new(|_| Reply::ok(json!({})));
    let store = Arc::new(FlakyStore::default());
    let h = harness(backend, store.clone());
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
      let queue = h.queue.clone();
      let seen = seen.clone();
      *store.on_save.lock() = Some(Box::new(move || seen.lock().push(queue.len())));
    }

    h.queue
      .enqueue(OfflineAction::create(Resource::Products, json!({"n": 1})))
      .unwrap();
    h.queue
      .enqueue(OfflineAction::create(Resource::Products, json!({"n": 2})))
      .unwrap();

    // Each save ran before the new state was published
    assert_eq!(*seen.lock(), vec![0, 1]);
    assert_eq!(h.queue.len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_wait_idle_returns_after_running_drain() {
    let backend = ScriptedBackend::new(|_| Reply::ok(json!({})).after(Duration::from_secs(1)));
    let h = harness(backend, Arc::new(MemoryStore::new()));
    h.queue
      .enqueue(OfflineAction::create(Resource::Products, json!({})))
      .unwrap();
    h.queue.wait_idle().await;

    let running = {
      let queue = h.queue.clone();
      tokio::spawn(async move { queue.drain().await })
    };
    tokio::task::yield_now().await;
    assert!(h.queue.is_draining());

    h.queue.wait_idle().await;
    assert!(!h.queue.is_draining());
    assert!(h.queue.is_empty());
    running.await.unwrap().unwrap();
  }

  #[test]
  fn test_persisted_shape() {
    let action = OfflineAction::delete(Resource::Orders, "O1");
    let json = serde_json::to_value(&action).unwrap();
    assert_eq!(json["type"], json!("DELETE"));
    assert_eq!(json["resource"], json!("orders"));
    assert_eq!(json["resourceId"], json!("O1"));
    assert_eq!(json["retryCount"], json!(0));
    assert_eq!(json["maxRetries"], json!(3));
  }
}
