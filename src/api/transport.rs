//! Wire transport seam and its reqwest implementation.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::descriptor::HttpMethod;

/// A fully resolved HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
  pub method: HttpMethod,
  pub url: String,
  pub headers: Vec<(String, String)>,
  pub query: Option<Value>,
  pub body: Option<Value>,
  pub timeout: Duration,
}

impl HttpRequest {
  pub fn new(method: HttpMethod, url: impl Into<String>, timeout: Duration) -> Self {
    Self {
      method,
      url: url.into(),
      headers: Vec::new(),
      query: None,
      body: None,
      timeout,
    }
  }

  pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// Look up a header value (case-insensitive).
  pub fn header_value(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// Any HTTP response, successful or not.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
  pub status: u16,
  /// Parsed JSON body; a non-JSON body is kept as a string, an empty one as null
  pub body: Value,
}

impl HttpResponse {
  pub fn new(status: u16, body: Value) -> Self {
    Self { status, body }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Failure before any response was received.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
  #[error("request timed out after {0:?}")]
  Timeout(Duration),

  #[error("connection failed: {0}")]
  Connect(String),

  #[error("request failed: {0}")]
  Other(String),
}

/// Sends one HTTP request.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// [`Transport`] backed by a shared `reqwest::Client`.
#[derive(Clone)]
pub struct ReqwestTransport {
  client: reqwest::Client,
}

impl ReqwestTransport {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("carelink/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

/// Flatten a JSON object into query pairs; strings are sent unquoted.
fn query_pairs(query: &Value) -> Vec<(String, String)> {
  match query {
    Value::Object(map) => map
      .iter()
      .filter(|(_, v)| !v.is_null())
      .map(|(k, v)| {
        let value = match v {
          Value::String(s) => s.clone(),
          other => other.to_string(),
        };
        (k.clone(), value)
      })
      .collect(),
    _ => Vec::new(),
  }
}

#[async_trait]
impl Transport for ReqwestTransport {
  async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
    let mut builder = self
      .client
      .request(request.method.into(), &request.url)
      .timeout(request.timeout);

    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }
    if let Some(query) = &request.query {
      builder = builder.query(&query_pairs(query));
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder.send().await.map_err(|e| {
      if e.is_timeout() {
        TransportError::Timeout(request.timeout)
      } else if e.is_connect() {
        TransportError::Connect(e.to_string())
      } else {
        TransportError::Other(e.to_string())
      }
    })?;

    let status = response.status().as_u16();
    let text = response.text().await.map_err(|e| {
      if e.is_timeout() {
        TransportError::Timeout(request.timeout)
      } else {
        TransportError::Other(e.to_string())
      }
    })?;

    let body = if text.trim().is_empty() {
      Value::Null
    } else {
      serde_json::from_str(&text).unwrap_or(Value::String(text))
    };

    debug!(method = %request.method, url = %request.url, status, "received HTTP response");
    Ok(HttpResponse { status, body })
  }
}
