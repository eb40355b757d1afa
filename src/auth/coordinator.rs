//! Access-token ownership and single-flight refresh.

use futures::FutureExt;
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::token::{self, AuthToken};
use crate::api::{ApiError, HttpMethod, HttpRequest, Transport, TransportError};
use crate::flight::SingleFlight;
use crate::store::PersistentStore;

/// Refresh calls made in total, the first included, before giving up.
pub const DEFAULT_MAX_REFRESH_ATTEMPTS: u32 = 3;

/// Base delay between refresh attempts; attempt `n` waits `n * backoff`.
pub const DEFAULT_REFRESH_BACKOFF: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
pub struct AuthConfig {
  /// Absolute URL of the refresh endpoint
  pub refresh_url: String,
  /// Refresh calls in total, the first included; 3 means one call plus two
  /// retries. Zero is treated as one.
  pub max_attempts: u32,
  /// Wait before retry `n` is `backoff * n`
  pub backoff: Duration,
  pub timeout: Duration,
}

impl AuthConfig {
  pub fn new(refresh_url: impl Into<String>) -> Self {
    Self {
      refresh_url: refresh_url.into(),
      max_attempts: DEFAULT_MAX_REFRESH_ATTEMPTS,
      backoff: DEFAULT_REFRESH_BACKOFF,
      timeout: Duration::from_secs(30),
    }
  }
}

/// Emitted when the session cannot be recovered and the host should log out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
  /// Status returned by the refresh endpoint; 0 when no refresh credential existed
  pub status: u16,
  pub reason: String,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
  token: Option<String>,
  #[serde(rename = "refreshToken")]
  refresh_token: Option<String>,
}

/// Outcome of one refresh-endpoint call.
enum Attempt {
  Refreshed(AuthToken),
  /// Worth retrying: no response, or a 5xx
  Transient(ApiError),
  /// Stop now without ending the session
  Fatal(ApiError),
  /// 401/403: the refresh credential is dead
  Rejected(ApiError),
}

struct AuthInner {
  token: RwLock<Option<AuthToken>>,
  store: Arc<dyn PersistentStore>,
  transport: Arc<dyn Transport>,
  config: AuthConfig,
  flight: SingleFlight<(), Result<AuthToken, ApiError>>,
  failures: Mutex<Option<mpsc::UnboundedSender<AuthFailure>>>,
}

/// Owns the current credential and coordinates refreshes.
///
/// State is `Idle` or `Refreshing`; at most one refresh runs at a time and
/// every concurrent [`AuthCoordinator::refresh`] caller receives its outcome.
#[derive(Clone)]
pub struct AuthCoordinator {
  inner: Arc<AuthInner>,
}

impl AuthCoordinator {
  pub fn new(
    store: Arc<dyn PersistentStore>,
    transport: Arc<dyn Transport>,
    config: AuthConfig,
  ) -> Self {
    Self {
      inner: Arc::new(AuthInner {
        token: RwLock::new(None),
        store,
        transport,
        config,
        flight: SingleFlight::new(),
        failures: Mutex::new(None),
      }),
    }
  }

  /// Install the persisted token, if any, without rewriting it.
  pub fn restore(&self) -> Option<AuthToken> {
    let restored = match token::load(self.inner.store.as_ref()) {
      Ok(token) => token,
      Err(e) => {
        warn!(error = %e, "failed to load persisted credentials");
        None
      }
    };
    if restored.is_some() {
      debug!("restored persisted credentials");
    }
    *self.inner.token.write().unwrap_or_else(PoisonError::into_inner) = restored.clone();
    restored
  }

  /// Install `token` as the outbound credential and persist it; `None` logs out.
  pub fn set_token(&self, token: Option<AuthToken>) {
    self.inner.install(token);
  }

  /// Clear the credential everywhere.
  pub fn logout(&self) {
    info!("logging out");
    self.inner.install(None);
  }

  pub fn token(&self) -> Option<AuthToken> {
    self.inner.current()
  }

  pub fn is_authenticated(&self) -> bool {
    self.token().is_some()
  }

  /// `Bearer …` header value for the current token.
  pub fn authorization_header(&self) -> Option<String> {
    self.token().map(|t| t.bearer())
  }

  /// Subscribe to unrecoverable authentication failures.
  ///
  /// There is a single subscriber; subscribing again replaces the previous one.
  pub fn on_auth_failure(&self) -> mpsc::UnboundedReceiver<AuthFailure> {
    let (tx, rx) = mpsc::unbounded_channel();
    *self
      .inner
      .failures
      .lock()
      .unwrap_or_else(PoisonError::into_inner) = Some(tx);
    rx
  }

  /// Whether a refresh is currently running.
  pub fn is_refreshing(&self) -> bool {
    self.inner.flight.in_flight(&())
  }

  /// Obtain a new access token from the refresh endpoint.
  ///
  /// Concurrent callers share one request. Transient failures are retried
  /// with linearly increasing delay; a 401/403 clears the credentials and
  /// notifies the auth-failure subscriber once.
  pub async fn refresh(&self) -> Result<AuthToken, ApiError> {
    let inner = Arc::clone(&self.inner);
    self
      .inner
      .flight
      .run((), move || async move { inner.run_refresh().await }.boxed())
      .await
  }
}

impl AuthInner {
  fn current(&self) -> Option<AuthToken> {
    self
      .token
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  fn install(&self, token: Option<AuthToken>) {
    if let Err(e) = token::persist(self.store.as_ref(), token.as_ref()) {
      warn!(error = %e, "failed to persist credentials");
    }
    *self.token.write().unwrap_or_else(PoisonError::into_inner) = token;
  }

  fn refresh_credential(&self) -> Option<String> {
    if let Some(refresh) = self.current().and_then(|t| t.refresh_token) {
      return Some(refresh);
    }
    match token::load_refresh_token(self.store.as_ref()) {
      Ok(refresh) => refresh,
      Err(e) => {
        warn!(error = %e, "failed to read refresh token");
        None
      }
    }
  }

  /// Clear credentials and tell the host application the session is over.
  fn end_session(&self, status: u16, reason: &str) {
    error!(status, reason, "authentication failed, ending session");
    self.install(None);

    let failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
    let delivered = failures
      .as_ref()
      .map(|tx| {
        tx.send(AuthFailure {
          status,
          reason: reason.to_string(),
        })
        .is_ok()
      })
      .unwrap_or(false);
    if !delivered {
      warn!("no auth failure subscriber");
    }
  }

  async fn run_refresh(&self) -> Result<AuthToken, ApiError> {
    let Some(refresh_token) = self.refresh_credential() else {
      let reason = "No refresh token available";
      self.end_session(0, reason);
      return Err(ApiError::new(
        crate::api::NetworkErrorKind::Auth,
        401,
        "NO_REFRESH_TOKEN",
        reason,
      ));
    };

    let max_attempts = self.config.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=max_attempts {
      info!(attempt, max_attempts, "refreshing access token");

      match self.attempt(&refresh_token).await {
        Attempt::Refreshed(token) => {
          self.install(Some(token.clone()));
          info!("access token refreshed");
          return Ok(token);
        }
        Attempt::Rejected(err) => {
          self.end_session(err.status, &err.message);
          return Err(err);
        }
        Attempt::Fatal(err) => {
          warn!(status = err.status, code = %err.code, "token refresh failed");
          return Err(err);
        }
        Attempt::Transient(err) => {
          warn!(attempt, status = err.status, error = %err, "token refresh attempt failed");
          last_error = Some(err);
        }
      }

      if attempt < max_attempts {
        tokio::time::sleep(self.config.backoff * attempt).await;
      }
    }

    let last = last_error.unwrap_or_else(|| ApiError::unknown("Token refresh failed"));
    error!(attempts = max_attempts, "token refresh gave up");
    Err(ApiError {
      message: format!(
        "Token refresh failed after {} attempts: {}",
        max_attempts, last.message
      ),
      ..ApiError::refresh(last.status, "")
    }
    .with_cause(last))
  }

  async fn attempt(&self, refresh_token: &str) -> Attempt {
    let request = HttpRequest::new(
      HttpMethod::Post,
      self.config.refresh_url.clone(),
      self.config.timeout,
    )
    .header("Content-Type", "application/json")
    .header("Accept", "application/json");
    let request = HttpRequest {
      body: Some(json!({ "refreshToken": refresh_token })),
      ..request
    };

    let response = match self.transport.send(request).await {
      Ok(response) => response,
      Err(TransportError::Timeout(d)) => {
        return Attempt::Transient(
          ApiError::timeout(format!("Token refresh timed out after {:?}", d)),
        )
      }
      Err(e) => {
        return Attempt::Transient(ApiError::network("Token refresh failed").with_cause(e))
      }
    };

    match response.status {
      200..=299 => {
        let parsed: Option<RefreshResponse> = serde_json::from_value(response.body).ok();
        match parsed.and_then(|r| r.token.map(|t| (t, r.refresh_token))) {
          Some((access_token, new_refresh)) => Attempt::Refreshed(AuthToken {
            access_token,
            refresh_token: new_refresh.or_else(|| Some(refresh_token.to_string())),
          }),
          None => Attempt::Fatal(ApiError::refresh(
            500,
            "Malformed refresh response: missing token",
          )),
        }
      }
      401 | 403 => Attempt::Rejected(ApiError::refresh(
        response.status,
        "Refresh token was rejected",
      )),
      status if status >= 500 => Attempt::Transient(ApiError::refresh(
        status,
        format!("Refresh endpoint returned {}", status),
      )),
      status => Attempt::Fatal(ApiError::refresh(
        status,
        format!("Refresh endpoint returned {}", status),
      )),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::HttpResponse;
  use crate::store::MemoryStore;
  use async_trait::async_trait;
  use std::collections::VecDeque;
  use std::sync::atomic::{AtomicUsize, Ordering};

  /// Transport that replays scripted refresh-endpoint outcomes.
  #[derive(Default)]
  struct ScriptedTransport {
    outcomes: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    calls: AtomicUsize,
    bodies: Mutex<Vec<serde_json::Value>>,
    delay: Duration,
  }

  impl ScriptedTransport {
    fn new(outcomes: Vec<Result<HttpResponse, TransportError>>) -> Self {
      Self {
        outcomes: Mutex::new(outcomes.into()),
        ..Default::default()
      }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
      self.delay = delay;
      self
    }

    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      self.bodies.lock().unwrap().push(request.body.clone().unwrap_or_default());
      if !self.delay.is_zero() {
        tokio::time::sleep(self.delay).await;
      }
      self
        .outcomes
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| Err(TransportError::Other("no scripted outcome".into())))
    }
  }

  fn ok(token: &str) -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse::new(200, json!({ "token": token })))
  }

  fn status(code: u16) -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse::new(code, serde_json::Value::Null))
  }

  fn coordinator(transport: Arc<ScriptedTransport>) -> (Arc<MemoryStore>, AuthCoordinator) {
    let store = Arc::new(MemoryStore::new());
    let auth = AuthCoordinator::new(
      store.clone(),
      transport,
      AuthConfig::new("https://api.test/auth/refresh"),
    );
    auth.set_token(Some(AuthToken::new("old", Some("refresh-1".into()))));
    (store, auth)
  }

  #[tokio::test]
  async fn test_refresh_installs_and_persists_new_token() {
    let transport = Arc::new(ScriptedTransport::new(vec![Ok(HttpResponse::new(
      200,
      json!({"token": "new", "refreshToken": "refresh-2"}),
    ))]));
    let (store, auth) = coordinator(transport.clone());

    let token = auth.refresh().await.unwrap();

    assert_eq!(token, AuthToken::new("new", Some("refresh-2".into())));
    assert_eq!(auth.authorization_header().as_deref(), Some("Bearer new"));
    assert_eq!(store.get("authToken").unwrap(), Some(b"new".to_vec()));
    assert_eq!(transport.bodies.lock().unwrap()[0], json!({"refreshToken": "refresh-1"}));
  }

  #[tokio::test]
  async fn test_refresh_keeps_refresh_token_when_not_rotated() {
    let transport = Arc::new(ScriptedTransport::new(vec![ok("new")]));
    let (_, auth) = coordinator(transport);

    let token = auth.refresh().await.unwrap();
    assert_eq!(token.refresh_token.as_deref(), Some("refresh-1"));
  }

  #[tokio::test]
  async fn test_concurrent_refreshes_share_one_call() {
    let transport = Arc::new(
      ScriptedTransport::new(vec![ok("shared"), ok("unexpected")])
        .with_delay(Duration::from_millis(50)),
    );
    let (_, auth) = coordinator(transport.clone());

    let results = futures::future::join_all((0..5).map(|_| auth.refresh())).await;

    for result in results {
      assert_eq!(result.unwrap().access_token, "shared");
    }
    assert_eq!(transport.calls(), 1);
    assert!(!auth.is_refreshing());
  }

  #[tokio::test(start_paused = true)]
  async fn test_transient_failures_retry_with_linear_backoff() {
    let transport = Arc::new(ScriptedTransport::new(vec![
      status(503),
      Err(TransportError::Connect("refused".into())),
      ok("third-time"),
    ]));
    let (_, auth) = coordinator(transport.clone());

    let started = tokio::time::Instant::now();
    let token = auth.refresh().await.unwrap();

    assert_eq!(token.access_token, "third-time");
    assert_eq!(transport.calls(), 3);
    // 1s after the first attempt, 2s after the second
    assert_eq!(started.elapsed(), Duration::from_millis(3000));
  }

  #[tokio::test(start_paused = true)]
  async fn test_exhausted_retries_surface_auth_error_without_logout() {
    let transport = Arc::new(ScriptedTransport::new(vec![status(500), status(502), status(503)]));
    let (_, auth) = coordinator(transport.clone());
    let mut failures = auth.on_auth_failure();

    let err = auth.refresh().await.unwrap_err();

    assert!(err.is_auth_error());
    assert_eq!(err.status, 503);
    assert_eq!(transport.calls(), 3);
    assert!(auth.is_authenticated());
    assert!(failures.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_rejected_refresh_clears_session_and_notifies_once() {
    let transport = Arc::new(
      ScriptedTransport::new(vec![status(401)]).with_delay(Duration::from_millis(20)),
    );
    let (store, auth) = coordinator(transport.clone());
    let mut failures = auth.on_auth_failure();

    let results = futures::future::join_all((0..3).map(|_| auth.refresh())).await;

    for result in results {
      let err = result.unwrap_err();
      assert!(err.is_auth_error());
      assert_eq!(err.code, "ERROR_401");
    }
    assert_eq!(transport.calls(), 1);
    assert!(!auth.is_authenticated());
    assert_eq!(store.get("authToken").unwrap(), None);
    assert_eq!(store.get("refreshToken").unwrap(), None);
    assert_eq!(failures.try_recv().unwrap().status, 401);
    assert!(failures.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_missing_refresh_token_is_unrecoverable() {
    let transport = Arc::new(ScriptedTransport::new(vec![]));
    let store = Arc::new(MemoryStore::new());
    let auth = AuthCoordinator::new(
      store,
      transport.clone(),
      AuthConfig::new("https://api.test/auth/refresh"),
    );
    auth.set_token(Some(AuthToken::new("access-only", None)));
    let mut failures = auth.on_auth_failure();

    let err = auth.refresh().await.unwrap_err();

    assert_eq!(err.code, "NO_REFRESH_TOKEN");
    assert_eq!(transport.calls(), 0);
    assert_eq!(failures.try_recv().unwrap().status, 0);
    assert!(!auth.is_authenticated());
  }

  #[tokio::test]
  async fn test_missing_token_in_response_is_malformed_and_not_retried() {
    let transport = Arc::new(ScriptedTransport::new(vec![
      Ok(HttpResponse::new(200, json!({"refreshToken": "r"}))),
      ok("never"),
    ]));
    let (_, auth) = coordinator(transport.clone());

    let err = auth.refresh().await.unwrap_err();

    assert_eq!(err.status, 500);
    assert!(!err.is_retryable());
    assert_eq!(transport.calls(), 1);
    assert_eq!(auth.token().unwrap().access_token, "old");
  }

  #[tokio::test]
  async fn test_restore_reads_persisted_token() {
    let transport = Arc::new(ScriptedTransport::new(vec![]));
    let (store, auth) = coordinator(transport.clone());
    drop(auth);

    let restored = AuthCoordinator::new(
      store,
      transport,
      AuthConfig::new("https://api.test/auth/refresh"),
    );
    assert!(!restored.is_authenticated());
    assert_eq!(restored.restore().unwrap().access_token, "old");
    assert_eq!(restored.authorization_header().as_deref(), Some("Bearer old"));
  }
}
