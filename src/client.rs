//! Composition root: builds the components once and hands out handles.

use color_eyre::Result;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::{
  ApiError, ApiResponse, HttpMethod, ReqwestTransport, RequestDescriptor, RequestExecutor, Transport,
};
use crate::auth::{AuthConfig, AuthCoordinator, AuthToken};
use crate::cache::CacheStore;
use crate::config::Config;
use crate::network::{ConnectivityProbe, NetworkMonitor, NetworkState};
use crate::query::{FacadeConfig, RequestFacade, RequestTarget};
use crate::store::{MemoryStore, PersistentStore, SqliteStore};

struct ClientInner {
  config: Config,
  store: Arc<dyn PersistentStore>,
  transport: Arc<dyn Transport>,
  cache: CacheStore,
  monitor: NetworkMonitor,
  auth: AuthCoordinator,
  executor: RequestExecutor,
  probe: Mutex<Option<CancellationToken>>,
}

/// One set of client components per process.
///
/// Construction wires store, cache, monitor, auth and executor together but
/// starts nothing; call [`ApiClient::start_probe`] or [`ApiClient::connect`]
/// to begin tracking connectivity and [`ApiClient::shutdown`] on exit.
#[derive(Clone)]
pub struct ApiClient {
  inner: Arc<ClientInner>,
}

impl ApiClient {
  pub fn new(
    config: Config,
    store: Arc<dyn PersistentStore>,
    transport: Arc<dyn Transport>,
  ) -> Result<Self> {
    let cache = CacheStore::new(store.clone())
      .with_max_size(config.cache.max_size_bytes)
      .with_default_ttl(config.default_ttl());
    let monitor = NetworkMonitor::new(store.clone(), config.network.queue_capacity);

    let auth = AuthCoordinator::new(
      store.clone(),
      transport.clone(),
      AuthConfig {
        refresh_url: config.endpoint(&config.auth.refresh_path),
        max_attempts: config.auth.max_refresh_attempts,
        backoff: config.refresh_backoff(),
        timeout: config.timeout(),
      },
    );
    auth.restore();

    let executor = RequestExecutor::new(
      transport.clone(),
      auth.clone(),
      monitor.clone(),
      cache.clone(),
      &config.api.base_url,
      config.timeout(),
    )?;

    Ok(Self {
      inner: Arc::new(ClientInner {
        config,
        store,
        transport,
        cache,
        monitor,
        auth,
        executor,
        probe: Mutex::new(None),
      }),
    })
  }

  /// Build a client over SQLite (or memory when `ephemeral`) and reqwest,
  /// seed credentials from the environment and start the probe.
  pub async fn open(config: Config, ephemeral: bool) -> Result<Self> {
    let store: Arc<dyn PersistentStore> = if ephemeral {
      Arc::new(MemoryStore::new())
    } else {
      let path = config.data_dir()?.join("store.db");
      Arc::new(SqliteStore::open_at(&path)?)
    };
    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new()?);

    let client = Self::new(config, store, transport)?;
    if !client.auth().is_authenticated() {
      if let Some((access, refresh)) = Config::env_tokens() {
        info!("using credentials from environment");
        client.auth().set_token(Some(AuthToken::new(access, refresh)));
      }
    }
    client.start_probe().await;

    Ok(client)
  }

  /// Subscribe the monitor to an external connectivity source.
  pub fn connect(&self, source: watch::Receiver<NetworkState>) {
    self.inner.monitor.start(source);
  }

  /// Start the HTTP reachability probe as the connectivity source.
  ///
  /// Returns after the first probe, so connectivity is known on return.
  pub async fn start_probe(&self) {
    let cancel = {
      let mut probe = self.inner.probe.lock().unwrap_or_else(PoisonError::into_inner);
      if probe.is_some() {
        return;
      }
      let cancel = CancellationToken::new();
      *probe = Some(cancel.clone());
      cancel
    };

    let config = &self.inner.config;
    let source = ConnectivityProbe::new(
      self.inner.transport.clone(),
      config.endpoint(&config.network.probe_path),
    )
    .with_interval(config.probe_interval())
    .with_timeout(config.timeout())
    .spawn(cancel)
    .await;

    self.inner.monitor.start(source);
  }

  /// Stop background tasks. Queued requests stay persisted.
  pub async fn shutdown(&self) {
    let probe = self
      .inner
      .probe
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    if let Some(cancel) = probe {
      cancel.cancel();
    }
    self.inner.monitor.shutdown().await;
    debug!("client shut down");
  }

  pub fn config(&self) -> &Config {
    &self.inner.config
  }

  pub fn store(&self) -> &Arc<dyn PersistentStore> {
    &self.inner.store
  }

  pub fn cache(&self) -> &CacheStore {
    &self.inner.cache
  }

  pub fn monitor(&self) -> &NetworkMonitor {
    &self.inner.monitor
  }

  pub fn auth(&self) -> &AuthCoordinator {
    &self.inner.auth
  }

  pub fn executor(&self) -> &RequestExecutor {
    &self.inner.executor
  }

  /// Descriptor for `method url` carrying the configured retry policy.
  pub fn descriptor(&self, method: HttpMethod, url: impl Into<String>) -> RequestDescriptor {
    RequestDescriptor::new(method, url)
      .retries(self.inner.config.api.retries)
      .retry_delay(self.inner.config.retry_delay())
  }

  pub async fn request(&self, descriptor: RequestDescriptor) -> Result<ApiResponse, ApiError> {
    self.inner.executor.execute(descriptor).await
  }

  pub async fn get<T: DeserializeOwned>(&self, url: &str, params: Option<Value>) -> Result<T, ApiError> {
    let descriptor = self.descriptor(HttpMethod::Get, url).maybe_params(params);
    self.request(descriptor).await?.json()
  }

  pub async fn post<T: DeserializeOwned>(&self, url: &str, body: Value) -> Result<T, ApiError> {
    self.send(HttpMethod::Post, url, Some(body)).await
  }

  pub async fn put<T: DeserializeOwned>(&self, url: &str, body: Value) -> Result<T, ApiError> {
    self.send(HttpMethod::Put, url, Some(body)).await
  }

  pub async fn patch<T: DeserializeOwned>(&self, url: &str, body: Value) -> Result<T, ApiError> {
    self.send(HttpMethod::Patch, url, Some(body)).await
  }

  pub async fn delete<T: DeserializeOwned>(&self, url: &str) -> Result<T, ApiError> {
    self.send(HttpMethod::Delete, url, None).await
  }

  async fn send<T: DeserializeOwned>(
    &self,
    method: HttpMethod,
    url: &str,
    body: Option<Value>,
  ) -> Result<T, ApiError> {
    let descriptor = self.descriptor(method, url).maybe_params(body);
    self.request(descriptor).await?.json()
  }

  /// Build a stateful facade for one logical query.
  pub fn query<T>(&self, target: RequestTarget, config: FacadeConfig<T>) -> RequestFacade<T>
  where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
  {
    RequestFacade::new(self.clone(), target, config)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use wiremock::matchers::{body_json, header, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  async fn online_client(server: &MockServer) -> (ApiClient, watch::Sender<NetworkState>) {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(ReqwestTransport::new().unwrap());
    let client = ApiClient::new(Config::with_base_url(server.uri()), store, transport).unwrap();
    let (tx, rx) = watch::channel(NetworkState::online("test"));
    client.connect(rx);
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    (client, tx)
  }

  #[tokio::test]
  async fn test_refresh_round_trip_against_http_server() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/profile"))
      .and(header("Authorization", "Bearer fresh"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "Ada"})))
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/profile"))
      .respond_with(ResponseTemplate::new(401))
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(path("/auth/refresh"))
      .and(body_json(json!({"refreshToken": "r1"})))
      .respond_with(
        ResponseTemplate::new(200).set_body_json(json!({"token": "fresh", "refreshToken": "r2"})),
      )
      .expect(1)
      .mount(&server)
      .await;

    let (client, _tx) = online_client(&server).await;
    client.auth().set_token(Some(AuthToken::new("stale", Some("r1".into()))));

    let profile: Value = client.get("/profile", None).await.unwrap();

    assert_eq!(profile, json!({"name": "Ada"}));
    assert_eq!(client.auth().token().unwrap().refresh_token.as_deref(), Some("r2"));
    client.shutdown().await;
  }

  #[tokio::test]
  async fn test_validation_errors_carry_details() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/appointments"))
      .respond_with(ResponseTemplate::new(422).set_body_json(json!({
        "message": "Invalid appointment",
        "errors": {"slot": ["taken"]}
      })))
      .expect(1)
      .mount(&server)
      .await;

    let (client, _tx) = online_client(&server).await;
    let err = client
      .post::<Value>("/appointments", json!({"slot": 2}))
      .await
      .unwrap_err();

    assert_eq!(err.status, 422);
    assert_eq!(err.details, Some(json!({"slot": ["taken"]})));
    assert!(!err.is_retryable());
    client.shutdown().await;
  }

  #[tokio::test]
  async fn test_queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("store.db");
    let config = Config::with_base_url("http://127.0.0.1:1");

    {
      let store = Arc::new(SqliteStore::open_at(&db).unwrap());
      let transport = Arc::new(ReqwestTransport::new().unwrap());
      let client = ApiClient::new(config.clone(), store, transport).unwrap();
      let (_tx, rx) = watch::channel(NetworkState::offline());
      client.connect(rx);
      tokio::time::sleep(std::time::Duration::from_millis(10)).await;

      let pending = client.clone();
      let task = tokio::spawn(async move { pending.post::<Value>("/notes", json!({"text": "hi"})).await });
      tokio::time::sleep(std::time::Duration::from_millis(10)).await;
      assert_eq!(client.monitor().pending_requests().len(), 1);
      task.abort();
      client.shutdown().await;
    }

    let store = Arc::new(SqliteStore::open_at(&db).unwrap());
    let transport = Arc::new(ReqwestTransport::new().unwrap());
    let client = ApiClient::new(config, store, transport).unwrap();
    let pending = client.monitor().pending_requests();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].url, "/notes");
    assert_eq!(pending[0].payload, Some(json!({"text": "hi"})));
  }
}
