//! Decoding of the API's JSON success/error envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::backend::HttpResponse;
use crate::error::{ApiError, ApiResult};

/// Rate-limit headers, surfaced to callers but never acted upon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
  pub limit: Option<u64>,
  pub remaining: Option<u64>,
  /// Reset time as sent by the server (epoch seconds)
  pub reset: Option<u64>,
}

impl RateLimit {
  pub fn from_headers(headers: &HashMap<String, String>) -> Option<Self> {
    let read = |name: &str| headers.get(name).and_then(|v| v.trim().parse().ok());

    let limit = Self {
      limit: read("x-ratelimit-limit"),
      remaining: read("x-ratelimit-remaining"),
      reset: read("x-ratelimit-reset"),
    };

    if limit == Self::default() {
      None
    } else {
      Some(limit)
    }
  }
}

/// Successful response payload.
#[derive(Debug, Clone)]
pub struct ApiPayload {
  pub status: u16,
  /// The envelope's `data`, or the whole body when it is not enveloped
  pub data: Value,
  pub message: Option<String>,
  pub request_id: Option<String>,
  pub timestamp: Option<String>,
  pub rate_limit: Option<RateLimit>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
  code: Option<String>,
  message: Option<String>,
  details: Option<Value>,
  timestamp: Option<String>,
  request_id: Option<String>,
}

/// Turn a raw response into a payload or a classified error.
///
/// `sent_request_id` is the `X-Request-ID` we sent; it is used when the server
/// does not echo one back.
pub fn decode(response: &HttpResponse, sent_request_id: &str) -> ApiResult<ApiPayload> {
  let status = response.status;
  let rate_limit = RateLimit::from_headers(&response.headers);
  let is_success_status = (200..300).contains(&status);

  let body = parse_body(&response.body);

  match body {
    Some(Value::Object(mut map)) if map.contains_key("success") => {
      let success = map.get("success").and_then(Value::as_bool).unwrap_or(false);
      let request_id = take_string(&mut map, "requestId");

      if success && is_success_status {
        return Ok(ApiPayload {
          status,
          data: map.remove("data").unwrap_or(Value::Null),
          message: take_string(&mut map, "message"),
          request_id: request_id.or_else(|| Some(sent_request_id.to_string())),
          timestamp: take_string(&mut map, "timestamp"),
          rate_limit,
        });
      }

      let body: ErrorBody = map
        .remove("error")
        .and_then(|e| serde_json::from_value(e).ok())
        .unwrap_or_default();
      let mut err = ApiError::from_status(status, body.code, body.message);
      err.details = body.details;
      err.timestamp = body.timestamp;
      err.request_id = body
        .request_id
        .or(request_id)
        .or_else(|| Some(sent_request_id.to_string()));
      err.rate_limit = rate_limit;
      Err(err)
    }
    body if is_success_status => Ok(ApiPayload {
      status,
      data: body.unwrap_or(Value::Null),
      message: None,
      request_id: Some(sent_request_id.to_string()),
      timestamp: None,
      rate_limit,
    }),
    body => {
      let message = body.as_ref().and_then(|b| match b {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("message").and_then(Value::as_str).map(String::from),
        _ => None,
      });
      let mut err = ApiError::from_status(status, None, message);
      err.request_id = Some(sent_request_id.to_string());
      err.rate_limit = rate_limit;
      Err(err)
    }
  }
}

fn parse_body(bytes: &[u8]) -> Option<Value> {
  if bytes.iter().all(u8::is_ascii_whitespace) {
    return None;
  }
  Some(
    serde_json::from_slice(bytes)
      .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned())),
  )
}

fn take_string(map: &mut serde_json::Map<String, Value>, key: &str) -> Option<String> {
  match map.remove(key) {
    Some(Value::String(s)) => Some(s),
    _ => None,
  }
}
