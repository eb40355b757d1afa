//! Request descriptors.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cache::request_cache_key;

/// Retries applied when a descriptor does not set its own.
pub const DEFAULT_RETRIES: u32 = 3;

/// Delay before the first retry; doubled on every subsequent one.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl HttpMethod {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Get => "GET",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Patch => "PATCH",
      Self::Delete => "DELETE",
    }
  }

  pub fn is_get(self) -> bool {
    self == Self::Get
  }

  /// Whether params travel in the query string rather than the body.
  pub fn uses_query(self) -> bool {
    matches!(self, Self::Get | Self::Delete)
  }
}

impl fmt::Display for HttpMethod {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for HttpMethod {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_uppercase().as_str() {
      "GET" => Ok(Self::Get),
      "POST" => Ok(Self::Post),
      "PUT" => Ok(Self::Put),
      "PATCH" => Ok(Self::Patch),
      "DELETE" => Ok(Self::Delete),
      other => Err(format!("unsupported HTTP method: {}", other)),
    }
  }
}

impl From<HttpMethod> for reqwest::Method {
  fn from(method: HttpMethod) -> Self {
    match method {
      HttpMethod::Get => reqwest::Method::GET,
      HttpMethod::Post => reqwest::Method::POST,
      HttpMethod::Put => reqwest::Method::PUT,
      HttpMethod::Patch => reqwest::Method::PATCH,
      HttpMethod::Delete => reqwest::Method::DELETE,
    }
  }
}

/// One logical request.
///
/// A descriptor is never mutated between attempts: a retry is issued with
/// [`RequestDescriptor::next_attempt`], a post-refresh replay with
/// [`RequestDescriptor::with_auth_retry`].
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
  pub method: HttpMethod,
  /// Absolute URL, or a path relative to the client's base URL
  pub url: String,
  /// Query parameters for GET/DELETE, JSON body otherwise
  pub params: Option<Value>,
  pub cache_key: Option<String>,
  pub cache_duration: Option<Duration>,
  pub force_refresh: bool,
  pub write_cache: bool,
  pub retries: u32,
  pub retry_delay: Duration,
  pub timeout: Option<Duration>,
  pub cancellation: CancellationToken,
  auth_retried: bool,
}

impl RequestDescriptor {
  pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
    Self {
      method,
      url: url.into(),
      params: None,
      cache_key: None,
      cache_duration: None,
      force_refresh: false,
      write_cache: true,
      retries: DEFAULT_RETRIES,
      retry_delay: DEFAULT_RETRY_DELAY,
      timeout: None,
      cancellation: CancellationToken::new(),
      auth_retried: false,
    }
  }

  pub fn get(url: impl Into<String>) -> Self {
    Self::new(HttpMethod::Get, url)
  }

  pub fn post(url: impl Into<String>, body: Value) -> Self {
    Self::new(HttpMethod::Post, url).params(body)
  }

  pub fn put(url: impl Into<String>, body: Value) -> Self {
    Self::new(HttpMethod::Put, url).params(body)
  }

  pub fn patch(url: impl Into<String>, body: Value) -> Self {
    Self::new(HttpMethod::Patch, url).params(body)
  }

  pub fn delete(url: impl Into<String>) -> Self {
    Self::new(HttpMethod::Delete, url)
  }

  pub fn params(mut self, params: Value) -> Self {
    self.params = Some(params);
    self
  }

  pub fn maybe_params(mut self, params: Option<Value>) -> Self {
    self.params = params;
    self
  }

  pub fn cache_key(mut self, key: impl Into<String>) -> Self {
    self.cache_key = Some(key.into());
    self
  }

  pub fn maybe_cache_key(mut self, key: Option<String>) -> Self {
    self.cache_key = key;
    self
  }

  pub fn cache_duration(mut self, ttl: Duration) -> Self {
    self.cache_duration = Some(ttl);
    self
  }

  pub fn maybe_cache_duration(mut self, ttl: Option<Duration>) -> Self {
    self.cache_duration = ttl;
    self
  }

  pub fn force_refresh(mut self, force: bool) -> Self {
    self.force_refresh = force;
    self
  }

  /// Skip write-through of a successful response.
  pub fn write_cache(mut self, write: bool) -> Self {
    self.write_cache = write;
    self
  }

  pub fn retries(mut self, retries: u32) -> Self {
    self.retries = retries;
    self
  }

  pub fn retry_delay(mut self, delay: Duration) -> Self {
    self.retry_delay = delay;
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn cancellation(mut self, token: CancellationToken) -> Self {
    self.cancellation = token;
    self
  }

  /// Descriptor for the next retry: one fewer retry left, twice the delay.
  pub fn next_attempt(&self) -> Self {
    Self {
      retries: self.retries.saturating_sub(1),
      retry_delay: self.retry_delay.saturating_mul(2),
      ..self.clone()
    }
  }

  /// Descriptor for the single replay after a token refresh.
  pub fn with_auth_retry(&self) -> Self {
    Self {
      auth_retried: true,
      ..self.clone()
    }
  }

  /// Whether this descriptor is already the post-refresh replay.
  pub fn is_auth_retry(&self) -> bool {
    self.auth_retried
  }

  /// The explicit cache key, or one derived from method, URL and params.
  pub fn effective_cache_key(&self) -> String {
    self.cache_key.clone().unwrap_or_else(|| {
      request_cache_key(self.method.as_str(), &self.url, self.params.as_ref())
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_next_attempt_decrements_retries_and_doubles_delay() {
    let d = RequestDescriptor::get("/vitals")
      .retries(3)
      .retry_delay(Duration::from_millis(1000));

    let second = d.next_attempt();
    let third = second.next_attempt();

    assert_eq!(second.retries, 2);
    assert_eq!(second.retry_delay, Duration::from_millis(2000));
    assert_eq!(third.retries, 1);
    assert_eq!(third.retry_delay, Duration::from_millis(4000));
    // The original is untouched
    assert_eq!(d.retries, 3);
  }

  #[test]
  fn test_auth_retry_marker() {
    let d = RequestDescriptor::post("/appointments", json!({"slot": 4}));
    assert!(!d.is_auth_retry());
    assert!(d.with_auth_retry().is_auth_retry());
    assert!(d.with_auth_retry().next_attempt().is_auth_retry());
  }

  #[test]
  fn test_effective_cache_key() {
    let explicit = RequestDescriptor::get("/profile").cache_key("profile");
    assert_eq!(explicit.effective_cache_key(), "profile");

    let derived = RequestDescriptor::get("/profile");
    assert!(derived.effective_cache_key().starts_with("req_"));
  }

  #[test]
  fn test_method_parsing() {
    assert_eq!("patch".parse::<HttpMethod>(), Ok(HttpMethod::Patch));
    assert!("TRACE".parse::<HttpMethod>().is_err());
    assert!(HttpMethod::Delete.uses_query());
    assert!(!HttpMethod::Post.uses_query());
  }
}
