//! Single-flight access token refresh.
//!
//! When several requests are rejected with a 401 at the same time, exactly
//! one of them (the leader) calls the refresh endpoint. The others park on a
//! continuation and are resolved in the order they arrived, with either the
//! new access token or a terminal authentication error.

use parking_lot::Mutex;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backend::{HttpBackend, HttpRequest};
use super::envelope;
use super::{SessionEvent, SessionEvents};
use crate::credentials::{CredentialPair, CredentialStore};
use crate::error::{ApiError, ApiResult};

pub const REFRESH_PATH: &str = "/auth/refresh";

type Continuation = oneshot::Sender<ApiResult<String>>;

#[derive(Default)]
struct RefreshState {
  in_flight: bool,
  waiters: VecDeque<Continuation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
  access_token: String,
  refresh_token: Option<String>,
}

pub struct RefreshCoordinator {
  backend: Arc<dyn HttpBackend>,
  credentials: CredentialStore,
  sessions: SessionEvents,
  timeout: Duration,
  state: Mutex<RefreshState>,
}

enum Role {
  Leader,
  Waiter(oneshot::Receiver<ApiResult<String>>),
  AlreadyRefreshed(String),
}

impl RefreshCoordinator {
  pub fn new(
    backend: Arc<dyn HttpBackend>,
    credentials: CredentialStore,
    sessions: SessionEvents,
    timeout: Duration,
  ) -> Self {
    Self {
      backend,
      credentials,
      sessions,
      timeout,
      state: Mutex::new(RefreshState::default()),
    }
  }

  /// Whether a refresh call is currently outstanding.
  pub fn is_refreshing(&self) -> bool {
    self.state.lock().in_flight
  }

  /// Obtain an access token newer than `rejected`, the token the server just refused.
  pub async fn fresh_token(&self, rejected: Option<&str>) -> ApiResult<String> {
    let role = {
      let mut state = self.state.lock();
      if state.in_flight {
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        Role::Waiter(rx)
      } else {
        match self.credentials.access_token() {
          // A refresh landed after this request went out
          Some(current) if rejected != Some(current.as_str()) => Role::AlreadyRefreshed(current),
          _ => {
            state.in_flight = true;
            Role::Leader
          }
        }
      }
    };

    match role {
      Role::AlreadyRefreshed(token) => Ok(token),
      Role::Waiter(rx) => {
        debug!("Refresh in flight, waiting");
        rx.await
          .unwrap_or_else(|_| Err(ApiError::network("token refresh was cancelled")))
      }
      Role::Leader => {
        let mut flight = Flight {
          coordinator: self,
          settled: false,
        };
        let outcome = self.perform_refresh().await;
        flight.settle(&outcome);
        outcome
      }
    }
  }

  async fn perform_refresh(&self) -> ApiResult<String> {
    let Some(refresh_token) = self.credentials.refresh_token() else {
      self.end_session("no refresh token available");
      return Err(ApiError::session_expired());
    };

    info!("Refreshing access token");

    let request_id = Uuid::new_v4().to_string();
    let request = HttpRequest {
      method: Method::POST,
      path: REFRESH_PATH.to_string(),
      headers: vec![
        ("Content-Type".to_string(), "application/json".to_string()),
        ("X-Request-ID".to_string(), request_id.clone()),
      ],
      body: Some(
        json!({ "refreshToken": refresh_token })
          .to_string()
          .into_bytes(),
      ),
    };

    let result = match tokio::time::timeout(self.timeout, self.backend.send(request)).await {
      Err(_) => Err(ApiError::timeout()),
      Ok(Err(failure)) => Err(ApiError::from(failure)),
      Ok(Ok(response)) => envelope::decode(&response, &request_id),
    };

    let parsed = result.and_then(|payload| {
      serde_json::from_value::<RefreshResponse>(payload.data).map_err(|e| {
        let mut err = ApiError::session_expired();
        err.details = Some(json!(format!("malformed refresh response: {}", e)));
        err
      })
    });

    match parsed {
      Ok(response) => {
        let pair = CredentialPair {
          access_token: response.access_token,
          refresh_token: response.refresh_token.unwrap_or(refresh_token),
        };
        let token = pair.access_token.clone();
        if let Err(e) = self.credentials.replace(pair) {
          warn!(error = %e, "Failed to persist refreshed credentials");
        }
        info!("Access token refreshed");
        Ok(token)
      }
      Err(err) => {
        warn!(error = %err, "Token refresh failed");
        self.end_session(&err.message);
        let mut terminal = ApiError::session_expired();
        terminal.request_id = err.request_id;
        Err(terminal)
      }
    }
  }

  fn end_session(&self, reason: &str) {
    if let Err(e) = self.credentials.clear() {
      warn!(error = %e, "Failed to clear credentials");
    }
    self.sessions.emit(SessionEvent::Invalidated {
      reason: reason.to_string(),
    });
  }
}

/// Releases the in-flight flag and resolves parked continuations, even if the
/// leader's future is dropped mid-refresh.
struct Flight<'a> {
  coordinator: &'a RefreshCoordinator,
  settled: bool,
}

impl Flight<'_> {
  fn settle(&mut self, outcome: &ApiResult<String>) {
    self.settled = true;
    let waiters = {
      let mut state = self.coordinator.state.lock();
      state.in_flight = false;
      std::mem::take(&mut state.waiters)
    };
    debug!(waiters = waiters.len(), ok = outcome.is_ok(), "Replaying parked requests");
    for waiter in waiters {
      let _ = waiter.send(outcome.clone());
    }
  }
}

impl Drop for Flight<'_> {
  fn drop(&mut self) {
    if !self.settled {
      self.settle(&Err(ApiError::network("token refresh was cancelled")));
    }
  }
}
