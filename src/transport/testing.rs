//! Scripted in-process backend for tests.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use reqwest::Method;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::backend::{HttpBackend, HttpRequest, HttpResponse, SendFailure};

/// A request as seen by the backend.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
  pub method: Method,
  pub path: String,
  /// Lowercased header names
  pub headers: HashMap<String, String>,
  pub body: Option<Value>,
  pub at: Instant,
}

impl RecordedRequest {
  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
  }

  pub fn bearer(&self) -> Option<&str> {
    self.header("authorization").and_then(|h| h.strip_prefix("Bearer "))
  }
}

/// What the backend does with one request.
pub struct Reply {
  delay: Option<Duration>,
  outcome: Result<HttpResponse, SendFailure>,
}

impl Reply {
  pub fn json(status: u16, body: Value) -> Self {
    Self {
      delay: None,
      outcome: Ok(HttpResponse {
        status,
        headers: HashMap::new(),
        body: serde_json::to_vec(&body).unwrap_or_default(),
      }),
    }
  }

  /// Success envelope around `data`.
  pub fn ok(data: Value) -> Self {
    Self::with_status(200, data)
  }

  pub fn with_status(status: u16, data: Value) -> Self {
    Self::json(
      status,
      json!({
        "success": true,
        "data": data,
        "timestamp": "2024-01-01T00:00:00Z",
        "requestId": "srv"
      }),
    )
  }

  /// Error envelope with no server code (classified by status).
  pub fn error(status: u16) -> Self {
    Self::json(
      status,
      json!({
        "success": false,
        "error": { "message": format!("status {}", status) }
      }),
    )
  }

  pub fn connection_refused() -> Self {
    Self {
      delay: None,
      outcome: Err(SendFailure::Connect("connection refused".to_string())),
    }
  }

  pub fn after(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }
}

type Handler = dyn Fn(&RecordedRequest) -> Reply + Send + Sync;

pub struct ScriptedBackend {
  handler: Box<Handler>,
  log: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedBackend {
  pub fn new(handler: impl Fn(&RecordedRequest) -> Reply + Send + Sync + 'static) -> Arc<Self> {
    Arc::new(Self {
      handler: Box::new(handler),
      log: Mutex::new(Vec::new()),
    })
  }

  pub fn requests(&self) -> Vec<RecordedRequest> {
    self.log.lock().clone()
  }

  pub fn count(&self, method: &Method, path: &str) -> usize {
    self
      .log
      .lock()
      .iter()
      .filter(|r| r.method == *method && r.path == path)
      .count()
  }
}

impl HttpBackend for ScriptedBackend {
  fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, SendFailure>> {
    let recorded = RecordedRequest {
      method: request.method,
      path: request.path,
      headers: request
        .headers
        .into_iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v))
        .collect(),
      body: request
        .body
        .and_then(|b| serde_json::from_slice(&b).ok()),
      at: Instant::now(),
    };
    let reply = (self.handler)(&recorded);
    self.log.lock().push(recorded);

    Box::pin(async move {
      if let Some(delay) = reply.delay {
        tokio::time::sleep(delay).await;
      }
      reply.outcome
    })
  }
}
