//! Authenticated HTTP transport.
//!
//! Every request carries the current access token and a fresh `X-Request-ID`.
//! Failures are classified into [`ApiError`]s here and nowhere else. Transient
//! failures are retried with exponential backoff (see [`RetryPolicy`]), and a
//! 401 triggers a single-flight token refresh followed by one replay.

mod backend;
mod envelope;
mod refresh;
mod retry;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{HttpBackend, HttpRequest, HttpResponse, ReqwestBackend, SendFailure};
pub use envelope::{ApiPayload, RateLimit};
pub use refresh::{RefreshCoordinator, REFRESH_PATH};
pub use retry::RetryPolicy;

use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::credentials::CredentialStore;
use crate::error::{ApiError, ApiResult, ErrorKind};

/// Notifications for the application's session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
  /// The refresh token was rejected or missing; the user must sign in again.
  Invalidated { reason: String },
}

/// The single "session invalidated" channel.
#[derive(Clone)]
pub struct SessionEvents {
  tx: broadcast::Sender<SessionEvent>,
}

impl Default for SessionEvents {
  fn default() -> Self {
    let (tx, _) = broadcast::channel(16);
    Self { tx }
  }
}

impl SessionEvents {
  pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
    self.tx.subscribe()
  }

  pub(crate) fn emit(&self, event: SessionEvent) {
    // No subscribers is fine
    let _ = self.tx.send(event);
  }
}

/// Per-request knobs.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
  /// Overrides the transport's default deadline
  pub timeout: Option<Duration>,
  /// Do not attempt a token refresh on 401
  pub skip_auth_refresh: bool,
  /// Do not retry transient failures
  pub skip_retry: bool,
  /// Extra headers
  pub headers: Vec<(String, String)>,
}

struct TransportInner {
  backend: Arc<dyn HttpBackend>,
  credentials: CredentialStore,
  refresh: RefreshCoordinator,
  sessions: SessionEvents,
  policy: RetryPolicy,
  timeout: Duration,
}

/// Cheap to clone; clones share credentials and refresh state.
#[derive(Clone)]
pub struct Transport {
  inner: Arc<TransportInner>,
}

impl Transport {
  pub fn new(
    backend: Arc<dyn HttpBackend>,
    credentials: CredentialStore,
    policy: RetryPolicy,
    timeout: Duration,
  ) -> Self {
    let sessions = SessionEvents::default();
    let refresh = RefreshCoordinator::new(
      backend.clone(),
      credentials.clone(),
      sessions.clone(),
      timeout,
    );

    Self {
      inner: Arc::new(TransportInner {
        backend,
        credentials,
        refresh,
        sessions,
        policy,
        timeout,
      }),
    }
  }

  pub fn credentials(&self) -> &CredentialStore {
    &self.inner.credentials
  }

  pub fn sessions(&self) -> &SessionEvents {
    &self.inner.sessions
  }

  pub fn is_refreshing(&self) -> bool {
    self.inner.refresh.is_refreshing()
  }

  /// GET `path` and return the payload's data.
  pub async fn get(&self, path: &str) -> ApiResult<Value> {
    self
      .request(Method::GET, path, None, &RequestOptions::default())
      .await
      .map(|p| p.data)
  }

  /// Send `body` with `method` and return the payload's data.
  pub async fn send_json(&self, method: Method, path: &str, body: Option<&Value>) -> ApiResult<Value> {
    self
      .request(method, path, body, &RequestOptions::default())
      .await
      .map(|p| p.data)
  }

  /// Issue a request with retry and refresh coordination.
  pub async fn request(
    &self,
    method: Method,
    path: &str,
    body: Option<&Value>,
    options: &RequestOptions,
  ) -> ApiResult<ApiPayload> {
    let policy = self.inner.policy;
    let mut retries = 0;
    let mut refreshed = false;

    loop {
      let err = match self
        .send_authorized(&method, path, body, options, &mut refreshed)
        .await
      {
        Ok(payload) => return Ok(payload),
        Err(err) => err,
      };

      if options.skip_retry || retries >= policy.max_retries || !err.is_retryable_for(&method) {
        return Err(err);
      }

      retries += 1;
      let delay = policy.delay_for(retries);
      warn!(
        %method,
        path,
        attempt = retries,
        delay_ms = delay.as_millis() as u64,
        error = %err,
        "Request failed, retrying"
      );
      tokio::time::sleep(delay).await;
    }
  }

  async fn send_authorized(
    &self,
    method: &Method,
    path: &str,
    body: Option<&Value>,
    options: &RequestOptions,
    refreshed: &mut bool,
  ) -> ApiResult<ApiPayload> {
    let token = self.inner.credentials.access_token();
    let result = self
      .send_once(method, path, body, token.as_deref(), options)
      .await;

    match result {
      Err(err) if err.is_authentication() && !options.skip_auth_refresh && !*refreshed => {
        *refreshed = true;
        debug!(path, "Access token rejected, refreshing");
        let fresh = self.inner.refresh.fresh_token(token.as_deref()).await?;
        self
          .send_once(method, path, body, Some(&fresh), options)
          .await
      }
      other => other,
    }
  }

  async fn send_once(
    &self,
    method: &Method,
    path: &str,
    body: Option<&Value>,
    token: Option<&str>,
    options: &RequestOptions,
  ) -> ApiResult<ApiPayload> {
    let request_id = Uuid::new_v4().to_string();

    let mut headers = vec![
      ("Content-Type".to_string(), "application/json".to_string()),
      ("X-Request-ID".to_string(), request_id.clone()),
    ];
    if let Some(token) = token {
      headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
    }
    headers.extend(options.headers.iter().cloned());

    let body = body
      .map(serde_json::to_vec)
      .transpose()
      .map_err(|e| {
        let mut err = ApiError::new(ErrorKind::Validation);
        err.details = Some(Value::String(e.to_string()));
        err
      })?;

    let request = HttpRequest {
      method: method.clone(),
      path: path.to_string(),
      headers,
      body,
    };

    debug!(request_id = %request_id, %method, path, "Sending request");

    let deadline = options.timeout.unwrap_or(self.inner.timeout);
    let response = match tokio::time::timeout(deadline, self.inner.backend.send(request)).await {
      Ok(Ok(response)) => response,
      Ok(Err(failure)) => return Err(ApiError::from(failure).with_request_id(request_id)),
      Err(_) => return Err(ApiError::timeout().with_request_id(request_id)),
    };

    let result = envelope::decode(&response, &request_id);
    if let Err(err) = &result {
      debug!(request_id = %request_id, status = response.status, kind = %err.kind, "Request failed");
    }
    result
  }
}
