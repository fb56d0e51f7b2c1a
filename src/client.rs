//! The synchronization layer wired together behind one handle.

use color_eyre::Result;
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheOptions, CacheStore};
use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::error::{ApiError, ApiResult, ErrorKind};
use crate::invalidation::{InvalidationDispatcher, MutationKind};
use crate::offline::{self, Connectivity, DrainReport, OfflineAction, OfflineQueue};
use crate::optimistic::{MutationSpec, OptimisticEngine, OptimisticUpdate};
use crate::storage::{PersistentStore, SqliteStore};
use crate::transport::{HttpBackend, ReqwestBackend, RetryPolicy, SessionEvents, Transport};

/// How often idle cache entries are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// What happened to a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
  /// The server accepted it; holds the response data
  Applied(Value),
  /// The server was unreachable; queued for replay under this action id
  Queued(String),
}

/// Client with caching, optimistic writes and offline support.
///
/// Reads go through the cache and writes through the optimistic engine. A
/// write that cannot reach the server is rolled back and queued, then
/// replayed when connectivity returns.
#[derive(Clone)]
pub struct SyncClient {
  config: Config,
  credentials: CredentialStore,
  transport: Transport,
  cache: CacheStore,
  engine: OptimisticEngine,
  queue: OfflineQueue,
  connectivity: Connectivity,
}

impl SyncClient {
  /// Open against the configured API and state database.
  pub fn open(config: &Config) -> Result<Self> {
    let storage = match &config.storage.path {
      Some(path) => SqliteStore::open(path)?,
      None => SqliteStore::open_default()?,
    };
    let backend = ReqwestBackend::new(&config.api.base_url, config.api.connect_timeout())?;
    Self::with_backend(config, Arc::new(backend), Arc::new(storage))
  }

  /// Build on an explicit backend and storage. Loads persisted credentials
  /// and queued actions.
  pub fn with_backend(
    config: &Config,
    backend: Arc<dyn HttpBackend>,
    storage: Arc<dyn PersistentStore>,
  ) -> Result<Self> {
    let credentials = CredentialStore::new(storage.clone());
    credentials.init()?;

    let transport = Transport::new(
      backend,
      credentials.clone(),
      RetryPolicy::from(&config.retry),
      config.api.timeout(),
    );
    let cache = CacheStore::new(CacheOptions::from(&config.cache));
    let dispatcher = InvalidationDispatcher::new(cache.clone());
    let engine = OptimisticEngine::new(cache.clone(), dispatcher.clone());
    let queue = OfflineQueue::new(storage, transport.clone(), dispatcher);
    let queued = queue.load()?;

    info!(
      signed_in = credentials.is_signed_in(),
      queued,
      base_url = %config.api.base_url,
      "Sync client ready"
    );

    Ok(Self {
      config: config.clone(),
      credentials,
      transport,
      cache,
      engine,
      queue,
      connectivity: Connectivity::default(),
    })
  }

  /// Spawn the background tasks: auto-drain on reconnect (if enabled) and the
  /// periodic cache sweep.
  pub fn start(&self) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();
    if self.config.offline.auto_drain {
      tasks.push(offline::spawn_auto_drain(self.queue.clone(), &self.connectivity));
    }

    let cache = self.cache.clone();
    tasks.push(tokio::spawn(async move {
      let mut interval = tokio::time::interval(SWEEP_INTERVAL);
      loop {
        interval.tick().await;
        cache.sweep();
      }
    }));
    tasks
  }

  pub fn credentials(&self) -> &CredentialStore {
    &self.credentials
  }

  pub fn transport(&self) -> &Transport {
    &self.transport
  }

  pub fn cache(&self) -> &CacheStore {
    &self.cache
  }

  pub fn optimistic(&self) -> &OptimisticEngine {
    &self.engine
  }

  pub fn queue(&self) -> &OfflineQueue {
    &self.queue
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  /// Subscribe here to learn when the user has to sign in again.
  pub fn sessions(&self) -> &SessionEvents {
    self.transport.sessions()
  }

  /// Read `path` through the cache under `key`.
  pub async fn query(&self, key: &CacheKey, path: &str) -> ApiResult<Value> {
    let transport = self.transport.clone();
    let connectivity = self.connectivity.clone();
    let path = path.to_string();

    self
      .cache
      .fetch_query(key, move || {
        let transport = transport.clone();
        let connectivity = connectivity.clone();
        let path = path.clone();
        async move { track(&connectivity, transport.get(&path).await) }
      })
      .await
  }

  /// Send a mutation with optimistic `updates`.
  ///
  /// Any failure restores the cache. A failure to reach the server also
  /// queues the mutation for replay and is reported as
  /// [`MutationOutcome::Queued`] rather than an error. A timeout is returned
  /// as is, since the server may have applied the write.
  ///
  /// Writes never overtake queued ones. With actions queued, the queue is
  /// drained first; if it cannot be emptied the mutation is queued behind
  /// them without touching the cache.
  pub async fn mutate(
    &self,
    spec: MutationSpec,
    body: Option<Value>,
    updates: Vec<OptimisticUpdate>,
  ) -> ApiResult<MutationOutcome> {
    let (method, path) = request_for(&spec)?;

    if !self.queue.is_empty() && !self.catch_up().await {
      return match self.enqueue(&spec, body) {
        Ok(id) => Ok(MutationOutcome::Queued(id)),
        Err(e) => {
          let mut err = ApiError::new(ErrorKind::Network);
          err.message = format!("Could not queue behind pending writes: {}", e);
          Err(err)
        }
      };
    }

    let transport = self.transport.clone();
    let connectivity = self.connectivity.clone();
    let request = {
      let body = body.clone();
      async move { track(&connectivity, transport.send_json(method, &path, body.as_ref()).await) }
    };

    match self.engine.mutate(&spec, updates, request).await {
      Ok(data) => Ok(MutationOutcome::Applied(data)),
      Err(err) if err.is_unreachable() => match self.enqueue(&spec, body) {
        Ok(id) => Ok(MutationOutcome::Queued(id)),
        Err(_) => Err(err),
      },
      Err(err) => Err(err),
    }
  }

  /// Drain ahead of a new write. Returns true once the queue is empty.
  async fn catch_up(&self) -> bool {
    // A replay attempt while offline would only burn a retry
    if !self.connectivity.is_online() {
      return false;
    }

    match self.queue.drain().await {
      Ok(report) if report.skipped => self.queue.wait_idle().await,
      Ok(report) if report.remaining > 0 => {
        self.connectivity.set_online(false);
      }
      Ok(_) => {}
      Err(e) => warn!(error = %e, "Failed to drain offline queue before write"),
    }
    self.queue.is_empty()
  }

  fn enqueue(&self, spec: &MutationSpec, body: Option<Value>) -> Result<String> {
    let action = OfflineAction::new(
      spec.kind.into(),
      spec.resource,
      spec.resource_id.clone(),
      body.unwrap_or(Value::Null),
    )
    .with_related(spec.related.clone())
    .with_max_retries(self.config.offline.max_retries);
    let id = action.id.clone();

    self.queue.enqueue(action).map_err(|e| {
      warn!(error = %e, resource = %spec.resource, "Failed to queue offline mutation");
      e
    })?;
    debug!(id = %id, resource = %spec.resource, "Mutation queued");
    Ok(id)
  }

  /// Replay queued mutations now.
  pub async fn drain_queue(&self) -> Result<DrainReport> {
    self.queue.drain().await
  }

  /// Forget the session: credentials, cached data and queued mutations.
  pub fn logout(&self) -> Result<()> {
    self.credentials.clear()?;
    self.cache.clear();
    self.queue.clear()?;
    info!("Logged out");
    Ok(())
  }
}

fn request_for(spec: &MutationSpec) -> ApiResult<(Method, String)> {
  let method = offline::ActionType::from(spec.kind).method();
  match (spec.kind, &spec.resource_id) {
    (MutationKind::Create, _) => Ok((method, spec.resource.path())),
    (_, Some(id)) => Ok((method, spec.resource.item_path(id))),
    (_, None) => {
      let mut err = ApiError::new(ErrorKind::Validation);
      err.message = format!("{} {} needs a resource id", spec.kind, spec.resource);
      Err(err)
    }
  }
}

/// Update connectivity from a transport outcome.
fn track<T>(connectivity: &Connectivity, result: ApiResult<T>) -> ApiResult<T> {
  match &result {
    Ok(_) => {
      connectivity.set_online(true);
    }
    Err(err) if err.is_unreachable() => {
      connectivity.set_online(false);
    }
    // The server answered, so we are online
    Err(err) if err.status.is_some() => {
      connectivity.set_online(true);
    }
    Err(_) => {}
  }
  result
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ListShape, SetOptions};
  use crate::invalidation::{RelatedIds, Resource};
  use crate::offline::QueueEvent;
  use crate::storage::MemoryStore;
  use crate::transport::testing::{Reply, ScriptedBackend};
  use serde_json::json;
  use std::sync::atomic::{AtomicBool, Ordering};

  fn config() -> Config {
    let mut config = Config::default();
    config.retry.max_retries = 0;
    config
  }

  fn client(backend: Arc<ScriptedBackend>) -> SyncClient {
    SyncClient::with_backend(&config(), backend, Arc::new(MemoryStore::new())).unwrap()
  }

  #[tokio::test]
  async fn test_query_is_cached() {
    let backend = ScriptedBackend::new(|_| Reply::ok(json!({"id": "Q1"})));
    let client = client(backend.clone());
    let key = CacheKey::detail("quotations", "Q1");

    client.query(&key, "/quotations/Q1").await.unwrap();
    let data = client.query(&key, "/quotations/Q1").await.unwrap();

    assert_eq!(data, json!({"id": "Q1"}));
    assert_eq!(backend.count(&Method::GET, "/quotations/Q1"), 1);
  }

  #[tokio::test]
  async fn test_create_order_from_quotation_invalidates_dependents() {
    let backend = ScriptedBackend::new(|req| match req.method {
      Method::POST => Reply::with_status(201, json!({"id": "O1", "quotationId": "Q1"})),
      _ => Reply::ok(json!({})),
    });
    let client = client(backend);
    let cache = client.cache();
    let quotation = CacheKey::detail("quotations", "Q1");
    let orders = CacheKey::list("orders").with_param("page", 1);
    cache.set(&quotation, json!({"status": "accepted"}), SetOptions::default());
    cache.set(&orders, json!({"items": [], "total": 0}), SetOptions::default());

    let outcome = client
      .mutate(
        MutationSpec::create(Resource::Orders).with_related(RelatedIds::quotation("Q1")),
        Some(json!({"quotationId": "Q1"})),
        vec![OptimisticUpdate::list_insert(
          orders.clone(),
          ListShape::default(),
          0,
          json!({"id": "tmp"}),
        )],
      )
      .await
      .unwrap();

    assert!(matches!(outcome, MutationOutcome::Applied(_)));
    assert_eq!(cache.get(&orders).unwrap()["total"], json!(1));
    assert!(cache.is_stale(&quotation));
    assert!(cache.is_stale(&orders));
  }

  #[tokio::test]
  async fn test_rejected_mutation_rolls_back_without_queueing() {
    let backend = ScriptedBackend::new(|_| Reply::error(403));
    let client = client(backend);
    let key = CacheKey::detail("customers", "C1");
    client
      .cache()
      .set(&key, json!({"name": "Acme"}), SetOptions::default());

    let err = client
      .mutate(
        MutationSpec::update(Resource::Customers, "C1"),
        Some(json!({"name": "Acme Ltd"})),
        vec![OptimisticUpdate::patch(key.clone(), |c| c["name"] = json!("Acme Ltd"))],
      )
      .await
      .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Authorization);
    assert_eq!(client.cache().get(&key), Some(json!({"name": "Acme"})));
    assert!(client.queue().is_empty());
    assert!(client.connectivity().is_online());
  }

  #[tokio::test]
  async fn test_offline_mutation_queued_then_replayed() {
    let reachable = Arc::new(AtomicBool::new(false));
    let backend = {
      let reachable = reachable.clone();
      ScriptedBackend::new(move |req| {
        if !reachable.load(Ordering::SeqCst) {
          return Reply::connection_refused();
        }
        match req.method {
          Method::POST => Reply::with_status(201, json!({"id": "C7"})),
          _ => Reply::ok(json!([])),
        }
      })
    };
    let client = client(backend.clone());
    let _tasks = client.start();
    let list = CacheKey::list("customers");
    client.cache().set(&list, json!([]), SetOptions::default());

    let outcome = client
      .mutate(
        MutationSpec::create(Resource::Customers),
        Some(json!({"name": "Acme"})),
        vec![OptimisticUpdate::list_insert(
          list.clone(),
          ListShape::bare(),
          0,
          json!({"name": "Acme"}),
        )],
      )
      .await
      .unwrap();

    let MutationOutcome::Queued(id) = outcome else {
      panic!("expected the mutation to be queued");
    };
    assert_eq!(client.cache().get(&list), Some(json!([])));
    assert!(!client.connectivity().is_online());
    assert_eq!(client.queue().pending()[0].id, id);
    assert_eq!(client.queue().pending()[0].payload, json!({"name": "Acme"}));

    // Any successful response flips connectivity back and triggers a drain
    let mut events = client.queue().subscribe();
    reachable.store(true, Ordering::SeqCst);
    client
      .query(&CacheKey::list("products"), "/products")
      .await
      .unwrap();

    loop {
      if let QueueEvent::Drained { replayed, .. } = events.recv().await.unwrap() {
        assert_eq!(replayed, 1);
        break;
      }
    }
    assert_eq!(backend.count(&Method::POST, "/customers"), 2);
    assert!(client.queue().is_empty());
    assert!(client.cache().is_stale(&list));
  }

  fn put_bodies(backend: &ScriptedBackend, path: &str) -> Vec<Value> {
    backend
      .requests()
      .into_iter()
      .filter(|r| r.method == Method::PUT && r.path == path)
      .filter_map(|r| r.body)
      .collect()
  }

  #[tokio::test]
  async fn test_write_goes_out_after_queued_write() {
    let backend = ScriptedBackend::new(|_| Reply::ok(json!({})));
    let client = client(backend.clone());
    client
      .queue()
      .enqueue(OfflineAction::update(Resource::Orders, "O1", json!({"v": 1})))
      .unwrap();

    let outcome = client
      .mutate(
        MutationSpec::update(Resource::Orders, "O1"),
        Some(json!({"v": 2})),
        Vec::new(),
      )
      .await
      .unwrap();

    assert!(matches!(outcome, MutationOutcome::Applied(_)));
    assert_eq!(put_bodies(&backend, "/orders/O1"), vec![json!({"v": 1}), json!({"v": 2})]);
    assert!(client.queue().is_empty());
  }

  #[tokio::test]
  async fn test_write_while_offline_queues_behind_pending_write() {
    let reachable = Arc::new(AtomicBool::new(false));
    let backend = {
      let reachable = reachable.clone();
      ScriptedBackend::new(move |_| {
        if reachable.load(Ordering::SeqCst) {
          Reply::ok(json!({}))
        } else {
          Reply::connection_refused()
        }
      })
    };
    let client = client(backend.clone());
    let key = CacheKey::detail("orders", "O1");
    client.cache().set(&key, json!({"v": 0}), SetOptions::default());

    let first = client
      .mutate(
        MutationSpec::update(Resource::Orders, "O1"),
        Some(json!({"v": 1})),
        Vec::new(),
      )
      .await
      .unwrap();
    assert!(matches!(first, MutationOutcome::Queued(_)));

    // The server is back but nothing has told the client yet
    reachable.store(true, Ordering::SeqCst);
    let second = client
      .mutate(
        MutationSpec::update(Resource::Orders, "O1"),
        Some(json!({"v": 2})),
        vec![OptimisticUpdate::replace(key.clone(), json!({"v": 2}))],
      )
      .await
      .unwrap();

    assert!(matches!(second, MutationOutcome::Queued(_)));
    assert_eq!(backend.requests().len(), 1);
    assert_eq!(client.cache().get(&key), Some(json!({"v": 0})));
    let payloads: Vec<Value> = client.queue().pending().into_iter().map(|a| a.payload).collect();
    assert_eq!(payloads, vec![json!({"v": 1}), json!({"v": 2})]);

    let report = client.drain_queue().await.unwrap();
    assert_eq!(report.replayed.len(), 2);
    let bodies = put_bodies(&backend, "/orders/O1");
    assert_eq!(&bodies[bodies.len() - 2..], &[json!({"v": 1}), json!({"v": 2})]);
  }

  #[tokio::test]
  async fn test_failed_catch_up_marks_offline_and_queues() {
    let backend = ScriptedBackend::new(|_| Reply::connection_refused());
    let client = client(backend.clone());
    client
      .queue()
      .enqueue(OfflineAction::delete(Resource::Products, "P1"))
      .unwrap();
    assert!(client.connectivity().is_online());

    let outcome = client
      .mutate(MutationSpec::delete(Resource::Products, "P2"), None, Vec::new())
      .await
      .unwrap();

    assert!(matches!(outcome, MutationOutcome::Queued(_)));
    assert!(!client.connectivity().is_online());
    assert_eq!(backend.count(&Method::DELETE, "/products/P1"), 1);
    assert_eq!(backend.count(&Method::DELETE, "/products/P2"), 0);
    assert_eq!(client.queue().len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_write_past_deadline_is_not_queued() {
    let backend = ScriptedBackend::new(|_| {
      Reply::with_status(201, json!({"id": "C1"})).after(Duration::from_secs(60))
    });
    let client = client(backend.clone());
    let list = CacheKey::list("customers");
    client.cache().set(&list, json!([]), SetOptions::default());

    let err = client
      .mutate(
        MutationSpec::create(Resource::Customers),
        Some(json!({"name": "Acme"})),
        vec![OptimisticUpdate::list_insert(
          list.clone(),
          ListShape::bare(),
          0,
          json!({"name": "Acme"}),
        )],
      )
      .await
      .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Timeout);
    assert_eq!(client.cache().get(&list), Some(json!([])));
    assert!(client.queue().is_empty());

    client.drain_queue().await.unwrap();
    assert_eq!(backend.count(&Method::POST, "/customers"), 1);
  }

  #[tokio::test]
  async fn test_update_without_id_is_rejected() {
    let backend = ScriptedBackend::new(|_| Reply::ok(json!({})));
    let client = client(backend.clone());
    let spec = MutationSpec {
      resource_id: None,
      ..MutationSpec::update(Resource::Orders, "x")
    };

    let err = client.mutate(spec, None, Vec::new()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);
    assert!(backend.requests().is_empty());
  }

  #[tokio::test]
  async fn test_logout_clears_everything() {
    let backend = ScriptedBackend::new(|_| Reply::ok(json!({})));
    let client = client(backend);
    client
      .credentials()
      .install(crate::credentials::CredentialPair {
        access_token: "a".to_string(),
        refresh_token: "r".to_string(),
      })
      .unwrap();
    client
      .cache()
      .set(&CacheKey::list("orders"), json!([]), SetOptions::default());
    client
      .queue()
      .enqueue(OfflineAction::delete(Resource::Orders, "O1"))
      .unwrap();

    client.logout().unwrap();

    assert!(!client.credentials().is_signed_in());
    assert!(client.cache().is_empty());
    assert!(client.queue().is_empty());
  }
}
