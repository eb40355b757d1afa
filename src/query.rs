//! Stateful per-query facade with cache strategies.
//!
//! A `RequestFacade<T>` wraps one logical request (method, URL, params) and
//! tracks its lifecycle the way UI code consumes it: `status`, `data`,
//! `error`, `updated_at` and `cache_info`, observable through a `watch`
//! channel.
//!
//! # Example
//!
//! ```ignore
//! let vitals = client.query::<Vec<Vital>>(
//!   RequestTarget::get("/vitals").cache_key("vitals"),
//!   FacadeConfig::default().strategy(CacheStrategy::CacheFirst),
//! );
//!
//! let mut updates = vitals.subscribe();
//! vitals.execute(ExecuteParams::default()).await?;
//!
//! match updates.borrow().status {
//!   QueryStatus::Loading => render_spinner(),
//!   QueryStatus::Success => render(vitals.data()),
//!   QueryStatus::Error => render_error(vitals.error()),
//!   QueryStatus::Idle => {}
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::{
  ApiError, ApiResponse, HttpMethod, NetworkErrorKind, RequestDescriptor, DEFAULT_RETRIES,
  DEFAULT_RETRY_DELAY,
};
use crate::cache::request_cache_key;
use crate::client::ApiClient;

/// How a facade combines the cache and the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
  /// Cached value if present and not forced, otherwise the network
  CacheFirst,
  /// Always the executor, which answers keyed GETs from the cache; the held
  /// value is used only when offline
  #[default]
  NetworkFirst,
  /// Cached value or `CACHE_MISS`; never the network
  CacheOnly,
  /// Skip cache reads, still write the result
  NetworkOnly,
}

impl CacheStrategy {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::CacheFirst => "cache-first",
      Self::NetworkFirst => "network-first",
      Self::CacheOnly => "cache-only",
      Self::NetworkOnly => "network-only",
    }
  }
}

impl fmt::Display for CacheStrategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for CacheStrategy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "cache-first" => Ok(Self::CacheFirst),
      "network-first" => Ok(Self::NetworkFirst),
      "cache-only" => Ok(Self::CacheOnly),
      "network-only" => Ok(Self::NetworkOnly),
      other => Err(format!("unknown cache strategy: {}", other)),
    }
  }
}

pub type ErrorCallback = Arc<dyn Fn(&ApiError) + Send + Sync>;
pub type SuccessCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Facade options.
pub struct FacadeConfig<T> {
  pub strategy: CacheStrategy,
  /// TTL for written entries; the cache default when `None`
  pub ttl: Option<Duration>,
  pub retries: u32,
  pub retry_delay: Duration,
  /// Execute once on construction
  pub auto_load: bool,
  /// Let a new `execute` run alongside a loading one instead of cancelling it
  pub skip_loading_check: bool,
  /// Write successful responses through to the cache
  pub write_cache: bool,
  pub on_error: Option<ErrorCallback>,
  pub on_success: Option<SuccessCallback<T>>,
}

impl<T> Default for FacadeConfig<T> {
  fn default() -> Self {
    Self {
      strategy: CacheStrategy::default(),
      ttl: None,
      retries: DEFAULT_RETRIES,
      retry_delay: DEFAULT_RETRY_DELAY,
      auto_load: false,
      skip_loading_check: false,
      write_cache: true,
      on_error: None,
      on_success: None,
    }
  }
}

impl<T> Clone for FacadeConfig<T> {
  fn clone(&self) -> Self {
    Self {
      strategy: self.strategy,
      ttl: self.ttl,
      retries: self.retries,
      retry_delay: self.retry_delay,
      auto_load: self.auto_load,
      skip_loading_check: self.skip_loading_check,
      write_cache: self.write_cache,
      on_error: self.on_error.clone(),
      on_success: self.on_success.clone(),
    }
  }
}

impl<T> fmt::Debug for FacadeConfig<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FacadeConfig")
      .field("strategy", &self.strategy)
      .field("ttl", &self.ttl)
      .field("retries", &self.retries)
      .field("retry_delay", &self.retry_delay)
      .field("auto_load", &self.auto_load)
      .field("skip_loading_check", &self.skip_loading_check)
      .field("write_cache", &self.write_cache)
      .finish_non_exhaustive()
  }
}

impl<T> FacadeConfig<T> {
  pub fn strategy(mut self, strategy: CacheStrategy) -> Self {
    self.strategy = strategy;
    self
  }

  pub fn ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
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

  pub fn auto_load(mut self, auto_load: bool) -> Self {
    self.auto_load = auto_load;
    self
  }

  pub fn skip_loading_check(mut self, skip: bool) -> Self {
    self.skip_loading_check = skip;
    self
  }

  pub fn write_cache(mut self, write: bool) -> Self {
    self.write_cache = write;
    self
  }

  pub fn on_error(mut self, callback: impl Fn(&ApiError) + Send + Sync + 'static) -> Self {
    self.on_error = Some(Arc::new(callback));
    self
  }

  pub fn on_success(mut self, callback: impl Fn(&T) + Send + Sync + 'static) -> Self {
    self.on_success = Some(Arc::new(callback));
    self
  }
}

/// Lifecycle of a facade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
  #[default]
  Idle,
  Loading,
  Success,
  Error,
}

/// Where the current data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
  Network,
  Cache,
  /// Held or cached value served because the network was unavailable
  Offline,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheInfo {
  pub is_cached: bool,
  pub source: Option<CacheSource>,
  pub key: Option<String>,
  pub cached_at: Option<DateTime<Utc>>,
  pub expires_at: Option<DateTime<Utc>>,
}

/// Observable state of a facade.
#[derive(Debug, Clone)]
pub struct QuerySnapshot<T> {
  pub status: QueryStatus,
  /// Kept across later errors
  pub data: Option<T>,
  pub error: Option<ApiError>,
  pub updated_at: Option<DateTime<Utc>>,
  pub cache_info: CacheInfo,
}

impl<T> Default for QuerySnapshot<T> {
  fn default() -> Self {
    Self {
      status: QueryStatus::Idle,
      data: None,
      error: None,
      updated_at: None,
      cache_info: CacheInfo::default(),
    }
  }
}

impl<T> QuerySnapshot<T> {
  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Loading
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }
}

/// The request a facade issues.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestTarget {
  pub method: HttpMethod,
  pub url: String,
  pub params: Option<Value>,
  pub cache_key: Option<String>,
}

impl RequestTarget {
  pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
    Self {
      method,
      url: url.into(),
      params: None,
      cache_key: None,
    }
  }

  pub fn get(url: impl Into<String>) -> Self {
    Self::new(HttpMethod::Get, url)
  }

  pub fn params(mut self, params: Value) -> Self {
    self.params = Some(params);
    self
  }

  pub fn cache_key(mut self, key: impl Into<String>) -> Self {
    self.cache_key = Some(key.into());
    self
  }
}

/// Per-call overrides for [`RequestFacade::execute`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecuteParams {
  /// Replaces the target's params
  pub params: Option<Value>,
  /// Replaces the target's cache key
  pub cache_key: Option<String>,
  pub cache_duration: Option<Duration>,
  pub force_refresh: bool,
}

impl ExecuteParams {
  pub fn params(mut self, params: Value) -> Self {
    self.params = Some(params);
    self
  }

  pub fn cache_key(mut self, key: impl Into<String>) -> Self {
    self.cache_key = Some(key.into());
    self
  }

  pub fn cache_duration(mut self, ttl: Duration) -> Self {
    self.cache_duration = Some(ttl);
    self
  }

  pub fn force_refresh(mut self, force: bool) -> Self {
    self.force_refresh = force;
    self
  }
}

/// Data plus where it came from.
struct Resolved<T> {
  data: T,
  info: CacheInfo,
}

struct FacadeInner<T> {
  client: ApiClient,
  target: RequestTarget,
  config: FacadeConfig<T>,
  state: watch::Sender<QuerySnapshot<T>>,
  /// Run id and token of the latest `execute`
  current: Mutex<Option<(u64, CancellationToken)>>,
  next_run: AtomicU64,
  last_params: Mutex<ExecuteParams>,
  dependencies: Mutex<Option<Value>>,
  lifetime: CancellationToken,
}

/// Disposes the facade once the last user handle is gone.
struct DisposeOnDrop(CancellationToken);

impl Drop for DisposeOnDrop {
  fn drop(&mut self) {
    self.0.cancel();
  }
}

/// Stateful wrapper around one logical request.
///
/// A new `execute` cancels a still-loading previous one unless
/// `skip_loading_check` is set. After [`RequestFacade::dispose`] (or when the
/// last handle is dropped) outstanding work is cancelled and state no longer
/// changes.
pub struct RequestFacade<T> {
  inner: Arc<FacadeInner<T>>,
  _handle: Arc<DisposeOnDrop>,
}

impl<T> Clone for RequestFacade<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
      _handle: Arc::clone(&self._handle),
    }
  }
}

impl<T> RequestFacade<T>
where
  T: DeserializeOwned + Clone + Send + Sync + 'static,
{
  pub fn new(client: ApiClient, target: RequestTarget, config: FacadeConfig<T>) -> Self {
    let (state, _) = watch::channel(QuerySnapshot::default());
    let lifetime = CancellationToken::new();
    let auto_load = config.auto_load;
    let facade = Self {
      inner: Arc::new(FacadeInner {
        client,
        target,
        config,
        state,
        current: Mutex::new(None),
        next_run: AtomicU64::new(0),
        last_params: Mutex::new(ExecuteParams::default()),
        dependencies: Mutex::new(None),
        lifetime: lifetime.clone(),
      }),
      _handle: Arc::new(DisposeOnDrop(lifetime)),
    };

    if auto_load {
      match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
          // State only; dropping the last handle still disposes
          let inner = Arc::clone(&facade.inner);
          runtime.spawn(async move {
            let _ = inner.execute(ExecuteParams::default()).await;
          });
        }
        Err(_) => warn!(url = %facade.inner.target.url, "auto_load needs a tokio runtime, not loading"),
      }
    }

    facade
  }

  /// Run the request with `params`, applying the configured strategy.
  pub async fn execute(&self, params: ExecuteParams) -> Result<T, ApiError> {
    self.inner.execute(params).await
  }

  /// Re-run the last call, bypassing the cache.
  pub async fn refresh(&self) -> Result<T, ApiError> {
    let params = self
      .inner
      .last_params
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone();
    self.execute(params.force_refresh(true)).await
  }

  /// Cancel any outstanding call and return to `Idle`.
  pub fn reset(&self) {
    if let Some((_, token)) = self.inner.take_current() {
      token.cancel();
    }
    self.inner.publish(|state| *state = QuerySnapshot::default());
  }

  /// Cancel outstanding work and stop all further state updates.
  pub fn dispose(&self) {
    debug!(url = %self.inner.target.url, "disposing facade");
    self.inner.lifetime.cancel();
  }

  pub fn is_disposed(&self) -> bool {
    self.inner.lifetime.is_cancelled()
  }

  /// Record new dependency values; re-executes with no parameters when they
  /// differ from the previous ones.
  ///
  /// The first call only records the values.
  pub async fn update_dependencies(&self, dependencies: Value) -> Option<Result<T, ApiError>> {
    let changed = {
      let mut current = self
        .inner
        .dependencies
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
      let changed = current.as_ref().map(|prev| *prev != dependencies).unwrap_or(false);
      *current = Some(dependencies);
      changed
    };

    if changed {
      Some(self.execute(ExecuteParams::default()).await)
    } else {
      None
    }
  }

  pub fn subscribe(&self) -> watch::Receiver<QuerySnapshot<T>> {
    self.inner.state.subscribe()
  }

  pub fn snapshot(&self) -> QuerySnapshot<T> {
    self.inner.state.borrow().clone()
  }

  pub fn status(&self) -> QueryStatus {
    self.inner.state.borrow().status
  }

  pub fn is_loading(&self) -> bool {
    self.status() == QueryStatus::Loading
  }

  pub fn data(&self) -> Option<T> {
    self.inner.state.borrow().data.clone()
  }

  pub fn error(&self) -> Option<ApiError> {
    self.inner.state.borrow().error.clone()
  }

  pub fn updated_at(&self) -> Option<DateTime<Utc>> {
    self.inner.state.borrow().updated_at
  }

  pub fn cache_info(&self) -> CacheInfo {
    self.inner.state.borrow().cache_info.clone()
  }
}

impl<T> FacadeInner<T>
where
  T: DeserializeOwned + Clone + Send + Sync + 'static,
{
  async fn execute(&self, params: ExecuteParams) -> Result<T, ApiError> {
    if self.lifetime.is_cancelled() {
      return Err(ApiError::cancelled());
    }

    *self.last_params.lock().unwrap_or_else(PoisonError::into_inner) = params.clone();
    let (run, token) = self.begin();
    let result = self.resolve(&params, &token).await;
    self.finish(run, &token, result)
  }

  /// Update observable state unless disposed.
  fn publish(&self, update: impl FnOnce(&mut QuerySnapshot<T>)) {
    if self.lifetime.is_cancelled() {
      return;
    }
    self.state.send_modify(update);
  }

  fn take_current(&self) -> Option<(u64, CancellationToken)> {
    self.current.lock().unwrap_or_else(PoisonError::into_inner).take()
  }

  /// Register a new run, superseding a loading one.
  fn begin(&self) -> (u64, CancellationToken) {
    let run = self.next_run.fetch_add(1, Ordering::Relaxed);
    let token = self.lifetime.child_token();

    let previous = self
      .current
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .replace((run, token.clone()));
    if let Some((_, previous)) = previous {
      if !self.config.skip_loading_check && self.state.borrow().status == QueryStatus::Loading {
        debug!(url = %self.target.url, "superseding loading call");
        previous.cancel();
      }
    }

    self.publish(|state| {
      state.status = QueryStatus::Loading;
      state.error = None;
    });
    (run, token)
  }

  fn finish(
    &self,
    run: u64,
    token: &CancellationToken,
    result: Result<Resolved<T>, ApiError>,
  ) -> Result<T, ApiError> {
    if token.is_cancelled() {
      return Err(ApiError::cancelled());
    }
    {
      let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
      if current.as_ref().map(|(id, _)| *id == run).unwrap_or(false) {
        *current = None;
      }
    }

    match result {
      Ok(Resolved { data, info }) => {
        self.publish(|state| {
          state.status = QueryStatus::Success;
          state.data = Some(data.clone());
          state.error = None;
          state.updated_at = Some(Utc::now());
          state.cache_info = info;
        });
        if let Some(on_success) = &self.config.on_success {
          on_success(&data);
        }
        Ok(data)
      }
      Err(err) => {
        self.publish(|state| {
          state.status = QueryStatus::Error;
          state.error = Some(err.clone());
          state.updated_at = Some(Utc::now());
        });
        if let Some(on_error) = &self.config.on_error {
          on_error(&err);
        }
        Err(err)
      }
    }
  }

  fn cached(&self, key: &str) -> Option<Resolved<T>> {
    let entry = self.client.cache().get_entry::<T>(key)?;
    Some(Resolved {
      data: entry.data,
      info: CacheInfo {
        is_cached: true,
        source: Some(CacheSource::Cache),
        key: Some(key.to_string()),
        cached_at: Some(entry.created_at),
        expires_at: Some(entry.expires_at),
      },
    })
  }

  async fn resolve(
    &self,
    params: &ExecuteParams,
    token: &CancellationToken,
  ) -> Result<Resolved<T>, ApiError> {
    let target = &self.target;
    let request_params = params.params.clone().or_else(|| target.params.clone());
    let explicit_key = params.cache_key.clone().or_else(|| target.cache_key.clone());
    let key = explicit_key.clone().unwrap_or_else(|| {
      request_cache_key(target.method.as_str(), &target.url, request_params.as_ref())
    });
    let ttl = params.cache_duration.or(self.config.ttl);

    match self.config.strategy {
      CacheStrategy::CacheOnly => {
        return self.cached(&key).ok_or_else(|| ApiError::cache_miss(&key));
      }
      CacheStrategy::CacheFirst if !params.force_refresh => {
        if let Some(hit) = self.cached(&key) {
          debug!(key = %key, "cache-first hit");
          return Ok(hit);
        }
      }
      _ => {}
    }

    // The executor serves a keyed GET from the cache unless forced
    let force = match self.config.strategy {
      CacheStrategy::NetworkOnly => true,
      _ => params.force_refresh,
    };
    let writes = self.config.write_cache && (target.method.is_get() || explicit_key.is_some());
    let descriptor = RequestDescriptor::new(target.method, target.url.clone())
      .maybe_params(request_params)
      .maybe_cache_key(explicit_key)
      .retries(self.config.retries)
      .retry_delay(self.config.retry_delay)
      .maybe_cache_duration(ttl)
      .write_cache(self.config.write_cache)
      .force_refresh(force)
      .cancellation(token.clone());

    match self.client.executor().execute(descriptor).await {
      Ok(response) => self.from_response(response, &key, ttl, writes),
      Err(err) if self.should_fall_back(&err) => self.offline_fallback(&key).ok_or(err),
      Err(err) => Err(err),
    }
  }

  fn from_response(
    &self,
    response: ApiResponse,
    key: &str,
    ttl: Option<Duration>,
    written: bool,
  ) -> Result<Resolved<T>, ApiError> {
    let data = response.json::<T>()?;
    let info = if response.from_cache {
      let source = if self.client.monitor().is_online() {
        CacheSource::Cache
      } else {
        CacheSource::Offline
      };
      CacheInfo {
        is_cached: true,
        source: Some(source),
        key: Some(key.to_string()),
        cached_at: response.cached_at,
        expires_at: response.expires_at,
      }
    } else {
      let now = Utc::now();
      let ttl = ttl.unwrap_or_else(|| self.client.cache().default_ttl());
      CacheInfo {
        is_cached: written,
        source: Some(CacheSource::Network),
        key: Some(key.to_string()),
        cached_at: written.then_some(now),
        expires_at: written
          .then(|| chrono::Duration::from_std(ttl).ok().map(|ttl| now + ttl))
          .flatten(),
      }
    };
    Ok(Resolved { data, info })
  }

  fn should_fall_back(&self, err: &ApiError) -> bool {
    self.config.strategy == CacheStrategy::NetworkFirst
      && matches!(err.kind, NetworkErrorKind::Network | NetworkErrorKind::Timeout)
      && !self.client.monitor().is_online()
  }

  /// Held value first, then the cache entry.
  fn offline_fallback(&self, key: &str) -> Option<Resolved<T>> {
    let held = {
      let state = self.state.borrow();
      state
        .data
        .clone()
        .map(|data| (data, state.cache_info.clone()))
    };
    if let Some((data, info)) = held {
      debug!(key = %key, "offline, serving held value");
      return Some(Resolved {
        data,
        info: CacheInfo {
          source: Some(CacheSource::Offline),
          ..info
        },
      });
    }

    self.cached(key).map(|hit| Resolved {
      info: CacheInfo {
        source: Some(CacheSource::Offline),
        ..hit.info
      },
      ..hit
    })
  }
}
