//! Issues one logical request: auth header, retry/backoff, offline queueing,
//! request-level caching and error normalization.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::descriptor::RequestDescriptor;
use super::error::{ApiError, NetworkErrorKind};
use super::transport::{HttpRequest, Transport, TransportError};
use crate::auth::AuthCoordinator;
use crate::cache::{CacheEntry, CacheStore};
use crate::flight::SingleFlight;
use crate::network::{NetworkMonitor, PendingReplay, PendingRequest, PendingTicket};

/// Per-attempt timeout when the descriptor does not set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Successful response, from the network or from the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
  pub status: u16,
  pub data: Value,
  pub from_cache: bool,
  pub cached_at: Option<DateTime<Utc>>,
  pub expires_at: Option<DateTime<Utc>>,
}

impl ApiResponse {
  pub fn new(status: u16, data: Value) -> Self {
    Self {
      status,
      data,
      from_cache: false,
      cached_at: None,
      expires_at: None,
    }
  }

  pub fn from_cache(entry: CacheEntry<Value>) -> Self {
    Self {
      status: 200,
      data: entry.data,
      from_cache: true,
      cached_at: Some(entry.created_at),
      expires_at: Some(entry.expires_at),
    }
  }

  /// Decode the body into `T`.
  pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
    serde_json::from_value(self.data.clone())
      .map_err(|e| ApiError::client("Failed to decode response body").with_cause(e))
  }
}

/// Whether a failed attempt should be retried by the generic backoff loop.
///
/// True for transport failures with no response, any status >= 500, and 429.
pub fn should_retry(error: &ApiError) -> bool {
  match error.kind {
    NetworkErrorKind::Network | NetworkErrorKind::Timeout => true,
    NetworkErrorKind::Cancelled | NetworkErrorKind::Auth => false,
    _ => error.status >= 500 || error.status == 429,
  }
}

struct ExecutorInner {
  transport: Arc<dyn Transport>,
  auth: AuthCoordinator,
  monitor: NetworkMonitor,
  cache: CacheStore,
  base_url: Url,
  timeout: Duration,
  flights: SingleFlight<String, Result<ApiResponse, ApiError>>,
}

/// Executes [`RequestDescriptor`]s.
///
/// Registers itself with the [`NetworkMonitor`] as the replayer for queued
/// requests. Concurrent GETs for the same cache key share one transport call.
#[derive(Clone)]
pub struct RequestExecutor {
  inner: Arc<ExecutorInner>,
}

impl RequestExecutor {
  pub fn new(
    transport: Arc<dyn Transport>,
    auth: AuthCoordinator,
    monitor: NetworkMonitor,
    cache: CacheStore,
    base_url: &str,
    timeout: Duration,
  ) -> Result<Self> {
    let base_url = parse_base_url(base_url)?;
    let inner = Arc::new(ExecutorInner {
      transport,
      auth,
      monitor: monitor.clone(),
      cache,
      base_url,
      timeout,
      flights: SingleFlight::new(),
    });

    let replayer: Weak<ExecutorInner> = Arc::downgrade(&inner);
    monitor.set_replayer(replayer);

    Ok(Self { inner })
  }

  pub fn base_url(&self) -> &Url {
    &self.inner.base_url
  }

  /// Execute one logical request.
  ///
  /// Offline, a GET is answered from the cache or fails fast; anything else
  /// is queued and this call waits until a drain sends it.
  pub async fn execute(&self, descriptor: RequestDescriptor) -> Result<ApiResponse, ApiError> {
    let inner = &self.inner;
    if descriptor.cancellation.is_cancelled() {
      return Err(ApiError::cancelled());
    }

    if descriptor.method.is_get() && !descriptor.force_refresh {
      if let Some(key) = &descriptor.cache_key {
        if let Some(entry) = inner.cache.get_entry::<Value>(key) {
          debug!(key = %key, "serving request from cache");
          return Ok(ApiResponse::from_cache(entry));
        }
      }
    }

    if !inner.monitor.is_online() {
      return inner.execute_offline(&descriptor).await;
    }

    let response = if descriptor.method.is_get() {
      inner.coalesced(&descriptor).await?
    } else {
      inner.run(descriptor.clone()).await?
    };
    inner.write_through(&descriptor, &response);
    Ok(response)
  }
}

fn parse_base_url(base_url: &str) -> Result<Url> {
  let mut normalized = base_url.trim().to_string();
  if !normalized.ends_with('/') {
    normalized.push('/');
  }
  Url::parse(&normalized).map_err(|e| eyre!("Invalid base URL '{}': {}", base_url, e))
}

impl ExecutorInner {
  fn resolve_url(&self, url: &str) -> Result<Url, ApiError> {
    match Url::parse(url) {
      Ok(absolute) => Ok(absolute),
      Err(url::ParseError::RelativeUrlWithoutBase) => self
        .base_url
        .join(url.trim_start_matches('/'))
        .map_err(|e| ApiError::client(format!("Invalid request URL '{}'", url)).with_cause(e)),
      Err(e) => Err(ApiError::client(format!("Invalid request URL '{}'", url)).with_cause(e)),
    }
  }

  async fn execute_offline(&self, descriptor: &RequestDescriptor) -> Result<ApiResponse, ApiError> {
    if descriptor.method.is_get() {
      let key = descriptor.effective_cache_key();
      return match self.cache.get_entry::<Value>(&key) {
        Some(entry) => {
          debug!(key = %key, "offline, serving cached response");
          Ok(ApiResponse::from_cache(entry))
        }
        None => Err(ApiError::network("No network connection and no cached data")),
      };
    }

    let PendingTicket { id, outcome } = self.monitor.add_pending_request(descriptor);
    tokio::select! {
      resolved = outcome => resolved
        .unwrap_or_else(|_| Err(ApiError::network("Queued request was discarded"))),
      _ = descriptor.cancellation.cancelled() => {
        self.monitor.remove_pending_request(&id);
        Err(ApiError::cancelled())
      }
    }
  }

  /// Run a GET through the in-flight table keyed by its cache key.
  async fn coalesced(self: &Arc<Self>, descriptor: &RequestDescriptor) -> Result<ApiResponse, ApiError> {
    let key = descriptor.effective_cache_key();
    let inner = Arc::clone(self);
    let shared = descriptor.clone().cancellation(CancellationToken::new());

    let flight = self
      .flights
      .run(key, move || async move { inner.run(shared).await }.boxed());

    tokio::select! {
      result = flight => result,
      _ = descriptor.cancellation.cancelled() => Err(ApiError::cancelled()),
    }
  }

  /// Attempt loop: token refresh on 401, backoff on retryable failures.
  async fn run(&self, descriptor: RequestDescriptor) -> Result<ApiResponse, ApiError> {
    let cancel = descriptor.cancellation.clone();
    let mut current = descriptor;

    loop {
      let result = tokio::select! {
        result = self.attempt(&current) => result,
        _ = cancel.cancelled() => return Err(ApiError::cancelled()),
      };
      let err = match result {
        Ok(response) => return Ok(response),
        Err(err) => err,
      };

      if err.status == 401 && !current.is_auth_retry() {
        info!(method = %current.method, url = %current.url, "received 401, refreshing token");
        let refreshed = tokio::select! {
          refreshed = self.auth.refresh() => refreshed,
          _ = cancel.cancelled() => return Err(ApiError::cancelled()),
        };
        match refreshed {
          Ok(_) => {
            current = current.with_auth_retry();
            continue;
          }
          Err(refresh_err) => return Err(refresh_err),
        }
      }

      if should_retry(&err) && current.retries > 0 {
        warn!(
          method = %current.method,
          url = %current.url,
          status = err.status,
          retries_left = current.retries,
          delay_ms = current.retry_delay.as_millis() as u64,
          "request failed, retrying"
        );
        tokio::select! {
          _ = tokio::time::sleep(current.retry_delay) => {}
          _ = cancel.cancelled() => return Err(ApiError::cancelled()),
        }
        current = current.next_attempt();
        continue;
      }

      debug!(method = %current.method, url = %current.url, error = %err, "request failed");
      return Err(err);
    }
  }

  async fn attempt(&self, descriptor: &RequestDescriptor) -> Result<ApiResponse, ApiError> {
    let url = self.resolve_url(&descriptor.url)?;
    let timeout = descriptor.timeout.unwrap_or(self.timeout);

    let mut request = HttpRequest::new(descriptor.method, url.as_str(), timeout)
      .header("Accept", "application/json");
    if let Some(authorization) = self.auth.authorization_header() {
      request = request.header("Authorization", authorization);
    }
    if descriptor.method.uses_query() {
      request.query = descriptor.params.clone();
    } else if let Some(body) = &descriptor.params {
      request = request.header("Content-Type", "application/json");
      request.body = Some(body.clone());
    }

    debug!(method = %descriptor.method, url = %url, "sending request");
    match self.transport.send(request).await {
      Ok(response) if response.is_success() => Ok(ApiResponse::new(response.status, response.body)),
      Ok(response) => Err(ApiError::from_response(response.status, &response.body)),
      Err(TransportError::Timeout(after)) => Err(ApiError::timeout(format!(
        "Request timed out after {}ms",
        after.as_millis()
      ))),
      Err(e) => Err(ApiError::network("Network error. Please check your connection.").with_cause(e)),
    }
  }

  fn write_through(&self, descriptor: &RequestDescriptor, response: &ApiResponse) {
    if response.from_cache || !descriptor.write_cache {
      return;
    }
    if !descriptor.method.is_get() && descriptor.cache_key.is_none() {
      return;
    }
    let key = descriptor.effective_cache_key();
    self.cache.set(&key, &response.data, descriptor.cache_duration);
  }
}

#[async_trait]
impl PendingReplay for ExecutorInner {
  async fn replay(&self, request: &PendingRequest) -> Result<ApiResponse, ApiError> {
    // The drain decides what happens to a failure; no backoff of our own
    let descriptor = request.to_descriptor().retries(0);
    let response = self.run(descriptor.clone()).await?;
    self.write_through(&descriptor, &response);
    Ok(response)
  }
}
