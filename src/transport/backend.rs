//! The raw HTTP seam: one request in, one response (or connection failure) out.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use reqwest::Method;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::error::ApiError;

/// A fully prepared request. Headers are already attached by the transport.
#[derive(Debug, Clone)]
pub struct HttpRequest {
  pub method: Method,
  /// Path relative to the API base, e.g. `/orders/42`
  pub path: String,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

/// A response as received. Header names are lowercased.
#[derive(Debug, Clone)]
pub struct HttpResponse {
  pub status: u16,
  pub headers: HashMap<String, String>,
  pub body: Vec<u8>,
}

/// The server was never reached or never answered.
#[derive(Debug, Error)]
pub enum SendFailure {
  #[error("connection failed: {0}")]
  Connect(String),
  #[error("request timed out")]
  TimedOut,
}

impl From<SendFailure> for ApiError {
  fn from(failure: SendFailure) -> Self {
    match failure {
      SendFailure::Connect(cause) => ApiError::network(cause),
      SendFailure::TimedOut => ApiError::timeout(),
    }
  }
}

/// Trait for HTTP backends.
pub trait HttpBackend: Send + Sync {
  fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, SendFailure>>;
}

/// Production backend over `reqwest`.
pub struct ReqwestBackend {
  client: reqwest::Client,
  base_url: Url,
}

impl ReqwestBackend {
  pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self> {
    let base_url =
      Url::parse(base_url).map_err(|e| eyre!("Invalid API base URL '{}': {}", base_url, e))?;

    let client = reqwest::Client::builder()
      .connect_timeout(connect_timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, base_url })
  }

  fn url_for(&self, path: &str) -> String {
    format!(
      "{}/{}",
      self.base_url.as_str().trim_end_matches('/'),
      path.trim_start_matches('/')
    )
  }
}

impl HttpBackend for ReqwestBackend {
  fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, SendFailure>> {
    let mut builder = self
      .client
      .request(request.method, self.url_for(&request.path));
    for (name, value) in request.headers {
      builder = builder.header(name, value);
    }
    if let Some(body) = request.body {
      builder = builder.body(body);
    }

    Box::pin(async move {
      let response = builder.send().await.map_err(|e| {
        if e.is_timeout() {
          SendFailure::TimedOut
        } else {
          SendFailure::Connect(e.to_string())
        }
      })?;

      let status = response.status().as_u16();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();

      let body = response
        .bytes()
        .await
        .map_err(|e| SendFailure::Connect(e.to_string()))?
        .to_vec();

      Ok(HttpResponse {
        status,
        headers,
        body,
      })
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_url_joining() {
    let backend = ReqwestBackend::new("https://api.example.com/v1/", Duration::from_secs(5)).unwrap();
    assert_eq!(
      backend.url_for("/orders/42"),
      "https://api.example.com/v1/orders/42"
    );
    assert_eq!(backend.url_for("orders"), "https://api.example.com/v1/orders");
  }

  #[test]
  fn test_invalid_base_url() {
    assert!(ReqwestBackend::new("not a url", Duration::from_secs(5)).is_err());
  }

  #[test]
  fn test_send_failure_classification() {
    let err: ApiError = SendFailure::Connect("refused".into()).into();
    assert!(err.is_offline());
    assert_eq!(err.kind, crate::error::ErrorKind::Network);

    let err: ApiError = SendFailure::TimedOut.into();
    assert_eq!(err.kind, crate::error::ErrorKind::Timeout);
  }
}
