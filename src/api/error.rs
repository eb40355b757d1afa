//! Normalized error returned by every request path.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Classification of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkErrorKind {
  /// No response was received
  Network,
  Timeout,
  /// 401 / 403
  Auth,
  /// 400 / 422
  Validation,
  /// 404
  NotFound,
  /// 5xx
  Server,
  Unknown,
  /// The caller's cancellation token fired before a result was available
  Cancelled,
}

impl NetworkErrorKind {
  /// Classify an HTTP status code.
  pub fn from_status(status: u16) -> Self {
    match status {
      401 | 403 => Self::Auth,
      400 | 422 => Self::Validation,
      404 => Self::NotFound,
      s if s >= 500 => Self::Server,
      _ => Self::Unknown,
    }
  }

  /// Whether a user-facing "retry" affordance makes sense for this kind.
  pub fn is_retryable(self) -> bool {
    matches!(
      self,
      Self::Network | Self::Timeout | Self::Server | Self::Unknown
    )
  }

  fn default_message(self) -> &'static str {
    match self {
      Self::Network => "Network error. Please check your connection.",
      Self::Timeout => "The request timed out. Please try again.",
      Self::Auth => "Your session has expired. Please sign in again.",
      Self::Validation => "The request contains invalid data.",
      Self::NotFound => "The requested resource was not found.",
      Self::Server => "The server encountered an error. Please try again later.",
      Self::Unknown => "An unexpected error occurred.",
      Self::Cancelled => "The request was cancelled.",
    }
  }
}

impl fmt::Display for NetworkErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Network => "network",
      Self::Timeout => "timeout",
      Self::Auth => "auth",
      Self::Validation => "validation",
      Self::NotFound => "notFound",
      Self::Server => "server",
      Self::Unknown => "unknown",
      Self::Cancelled => "cancelled",
    };
    f.write_str(name)
  }
}

/// Terminal error value handed to callers.
///
/// `status` is 0 when no HTTP response was received.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{message} [{code}]")]
pub struct ApiError {
  pub kind: NetworkErrorKind,
  pub status: u16,
  pub message: String,
  pub code: String,
  /// Field-level validation details, when the server supplied them
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub details: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cause: Option<String>,
}

impl ApiError {
  pub fn new(
    kind: NetworkErrorKind,
    status: u16,
    code: impl Into<String>,
    message: impl Into<String>,
  ) -> Self {
    Self {
      kind,
      status,
      message: message.into(),
      code: code.into(),
      details: None,
      cause: None,
    }
  }

  /// No response was received.
  pub fn network(message: impl Into<String>) -> Self {
    Self::new(NetworkErrorKind::Network, 0, "NETWORK_ERROR", message)
  }

  pub fn timeout(message: impl Into<String>) -> Self {
    Self::new(NetworkErrorKind::Timeout, 0, "NETWORK_ERROR", message)
  }

  pub fn cancelled() -> Self {
    Self::new(
      NetworkErrorKind::Cancelled,
      0,
      "REQUEST_CANCELLED",
      NetworkErrorKind::Cancelled.default_message(),
    )
  }

  /// Nothing cached under `key` and the strategy forbids the network.
  pub fn cache_miss(key: &str) -> Self {
    Self::new(
      NetworkErrorKind::NotFound,
      404,
      "CACHE_MISS",
      format!("No cached data for '{}'", key),
    )
  }

  /// Local failure that did not involve the network (encoding, bad URL, ...).
  pub fn client(message: impl Into<String>) -> Self {
    Self::new(NetworkErrorKind::Unknown, 0, "CLIENT_ERROR", message)
  }

  pub fn unknown(message: impl Into<String>) -> Self {
    Self::new(NetworkErrorKind::Unknown, 0, "UNKNOWN_ERROR", message)
  }

  /// Failure reported by the token refresh endpoint.
  pub fn refresh(status: u16, message: impl Into<String>) -> Self {
    Self::new(
      NetworkErrorKind::Auth,
      status,
      format!("ERROR_{}", status),
      message,
    )
  }

  /// Build an error from a non-2xx response body.
  ///
  /// `code` and `message` are taken from the body when present; validation
  /// errors keep the server's field-level details.
  pub fn from_response(status: u16, body: &Value) -> Self {
    let kind = NetworkErrorKind::from_status(status);

    let code = body
      .get("code")
      .and_then(Value::as_str)
      .map(String::from)
      .unwrap_or_else(|| format!("HTTP_{}", status));

    let message = ["message", "error", "detail"]
      .iter()
      .find_map(|field| body.get(*field).and_then(Value::as_str))
      .or_else(|| body.as_str().filter(|s| !s.is_empty()))
      .unwrap_or_else(|| kind.default_message())
      .to_string();

    let details = if kind == NetworkErrorKind::Validation {
      ["errors", "details", "fields"]
        .iter()
        .find_map(|field| body.get(*field).cloned())
    } else {
      None
    };

    Self {
      kind,
      status,
      message,
      code,
      details,
      cause: None,
    }
  }

  pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
    self.cause = Some(cause.to_string());
    self
  }

  pub fn is_retryable(&self) -> bool {
    self.kind.is_retryable()
  }

  pub fn is_auth_error(&self) -> bool {
    self.kind == NetworkErrorKind::Auth
  }

  pub fn is_not_found(&self) -> bool {
    self.kind == NetworkErrorKind::NotFound
  }

  pub fn is_cancelled(&self) -> bool {
    self.kind == NetworkErrorKind::Cancelled
  }

  /// Whether the server answered at all.
  pub fn has_response(&self) -> bool {
    self.status != 0
  }
}
