//! Error taxonomy for everything that crosses the network boundary.
//!
//! The transport is the only place raw failures are classified. Everything
//! above it treats [`ApiError`] opaquely and branches only on
//! [`ApiError::is_retryable_for`], [`ApiError::is_offline`] and
//! [`ApiError::is_authentication`].

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::transport::RateLimit;

/// Classified failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
  /// 400 - request rejected by input validation
  Validation,
  /// 401 - missing, expired or revoked credentials
  Authentication,
  /// 403 - authenticated but not allowed
  Authorization,
  /// 404
  NotFound,
  /// 429
  RateLimit,
  /// 422, or a 400/409 carrying a domain error code
  BusinessLogic,
  /// 502/503/504 - an upstream dependency of the API failed
  ExternalService,
  /// 500 and any other 5xx
  InternalServer,
  /// No response at all (DNS, refused, reset)
  Network,
  /// Aborted after the deadline, or 408 from the server
  Timeout,
}

impl ErrorKind {
  /// Machine-readable code, matching the server's error envelope codes.
  pub fn code(&self) -> &'static str {
    match self {
      Self::Validation => "VALIDATION_ERROR",
      Self::Authentication => "AUTHENTICATION_ERROR",
      Self::Authorization => "AUTHORIZATION_ERROR",
      Self::NotFound => "RESOURCE_NOT_FOUND",
      Self::RateLimit => "RATE_LIMIT_EXCEEDED",
      Self::BusinessLogic => "BUSINESS_LOGIC_ERROR",
      Self::ExternalService => "EXTERNAL_SERVICE_ERROR",
      Self::InternalServer => "INTERNAL_SERVER_ERROR",
      Self::Network => "NETWORK_ERROR",
      Self::Timeout => "TIMEOUT_ERROR",
    }
  }

  /// Parse a server-supplied error code.
  pub fn from_code(code: &str) -> Option<Self> {
    let kind = match code {
      "VALIDATION_ERROR" => Self::Validation,
      "AUTHENTICATION_ERROR" => Self::Authentication,
      "AUTHORIZATION_ERROR" => Self::Authorization,
      "RESOURCE_NOT_FOUND" | "NOT_FOUND" => Self::NotFound,
      "RATE_LIMIT_EXCEEDED" => Self::RateLimit,
      "BUSINESS_LOGIC_ERROR" => Self::BusinessLogic,
      "EXTERNAL_SERVICE_ERROR" => Self::ExternalService,
      "INTERNAL_SERVER_ERROR" => Self::InternalServer,
      "NETWORK_ERROR" => Self::Network,
      "TIMEOUT_ERROR" => Self::Timeout,
      _ => return None,
    };
    Some(kind)
  }

  /// Classify an HTTP status, letting a recognized server code win.
  pub fn classify(status: u16, code: Option<&str>) -> Self {
    if let Some(kind) = code.and_then(Self::from_code) {
      return kind;
    }

    match status {
      400 => Self::Validation,
      401 => Self::Authentication,
      403 => Self::Authorization,
      404 => Self::NotFound,
      408 => Self::Timeout,
      409 | 422 => Self::BusinessLogic,
      429 => Self::RateLimit,
      502..=504 => Self::ExternalService,
      s if s >= 500 => Self::InternalServer,
      _ => Self::Validation,
    }
  }

  /// Human-readable message used when the server did not send one.
  pub fn default_message(&self) -> &'static str {
    match self {
      Self::Validation => "The request contains invalid data.",
      Self::Authentication => "Your session has expired. Please sign in again.",
      Self::Authorization => "You do not have permission to perform this action.",
      Self::NotFound => "The requested resource was not found.",
      Self::RateLimit => "Too many requests. Please wait a moment and try again.",
      Self::BusinessLogic => "The operation is not allowed in the current state.",
      Self::ExternalService => "A dependent service is unavailable. Please try again later.",
      Self::InternalServer => "An unexpected server error occurred.",
      Self::Network => "Unable to reach the server. Check your connection.",
      Self::Timeout => "The request timed out.",
    }
  }
}

impl std::fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.code())
  }
}

/// A classified API failure.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ApiError {
  pub kind: ErrorKind,
  /// HTTP status, absent for network failures and client timeouts
  pub status: Option<u16>,
  /// Machine code as sent by the server, or the kind's code
  pub code: String,
  pub message: String,
  pub details: Option<Value>,
  pub request_id: Option<String>,
  pub timestamp: Option<String>,
  pub rate_limit: Option<RateLimit>,
}

/// Result alias for operations that can fail with an [`ApiError`].
pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
  /// Build an error of `kind` with its default code and message.
  pub fn new(kind: ErrorKind) -> Self {
    Self {
      kind,
      status: None,
      code: kind.code().to_string(),
      message: kind.default_message().to_string(),
      details: None,
      request_id: None,
      timestamp: None,
      rate_limit: None,
    }
  }

  /// No response was received.
  pub fn network(cause: impl std::fmt::Display) -> Self {
    let mut err = Self::new(ErrorKind::Network);
    err.details = Some(Value::String(cause.to_string()));
    err
  }

  /// The request was aborted after its deadline.
  pub fn timeout() -> Self {
    Self::new(ErrorKind::Timeout)
  }

  /// Terminal authentication failure after a refresh could not recover the session.
  pub fn session_expired() -> Self {
    Self::new(ErrorKind::Authentication)
  }

  /// Error from an HTTP status and optional server-supplied fields.
  pub fn from_status(status: u16, code: Option<String>, message: Option<String>) -> Self {
    let kind = ErrorKind::classify(status, code.as_deref());
    Self {
      kind,
      status: Some(status),
      code: code.unwrap_or_else(|| kind.code().to_string()),
      message: message
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| kind.default_message().to_string()),
      details: None,
      request_id: None,
      timestamp: None,
      rate_limit: None,
    }
  }

  pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
    self.request_id = Some(request_id.into());
    self
  }

  pub fn is_authentication(&self) -> bool {
    self.kind == ErrorKind::Authentication
  }

  /// Failures that mean "the server was not reached"; worth retrying later.
  pub fn is_offline(&self) -> bool {
    matches!(self.kind, ErrorKind::Network | ErrorKind::Timeout) && self.status.is_none()
  }

  /// The request never left the device. Unlike a timeout, the server cannot
  /// have applied it.
  pub fn is_unreachable(&self) -> bool {
    self.kind == ErrorKind::Network && self.status.is_none()
  }

  /// Whether the transport may transparently retry this failure for `method`.
  ///
  /// Reads retry on anything transient. Writes only retry when the server
  /// provably did not process the request (408, 429, no connection); an
  /// ambiguous 5xx on a write is never retried.
  pub fn is_retryable_for(&self, method: &Method) -> bool {
    if self.is_unreachable() {
      return true;
    }
    let status = self.status.unwrap_or(0);
    if status == 408 || status == 429 {
      return true;
    }

    if is_read(method) {
      return self.kind == ErrorKind::Timeout || status >= 500;
    }
    false
  }
}

/// GET and HEAD never change server state.
pub fn is_read(method: &Method) -> bool {
  *method == Method::GET || *method == Method::HEAD
}
