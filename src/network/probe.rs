//! HTTP reachability probe used as the connectivity source.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::state::NetworkState;
use crate::api::{HttpMethod, HttpRequest, Transport, TransportError};

/// Interval between probes when none is configured.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(15);

/// Periodically issues `GET {url}` and reports the result as a [`NetworkState`].
///
/// Any HTTP response counts as reachable, whatever its status.
#[derive(Clone)]
pub struct ConnectivityProbe {
  transport: Arc<dyn Transport>,
  url: String,
  interval: Duration,
  timeout: Duration,
}

impl ConnectivityProbe {
  pub fn new(transport: Arc<dyn Transport>, url: impl Into<String>) -> Self {
    Self {
      transport,
      url: url.into(),
      interval: DEFAULT_PROBE_INTERVAL,
      timeout: Duration::from_secs(5),
    }
  }

  pub fn with_interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  /// Probe once.
  pub async fn check(&self) -> NetworkState {
    let request = HttpRequest::new(HttpMethod::Get, self.url.clone(), self.timeout);
    match self.transport.send(request).await {
      Ok(response) => {
        debug!(url = %self.url, status = response.status, "probe reached server");
        NetworkState::online("http")
      }
      Err(TransportError::Timeout(_)) => {
        debug!(url = %self.url, "probe timed out");
        NetworkState {
          connected: true,
          reachable: Some(false),
          kind: "http".to_string(),
        }
      }
      Err(e) => {
        debug!(url = %self.url, error = %e, "probe failed");
        NetworkState::offline()
      }
    }
  }

  /// Probe once, then every interval until `cancel` fires, publishing changes only.
  ///
  /// The returned channel already holds the first result.
  pub async fn spawn(self, cancel: CancellationToken) -> watch::Receiver<NetworkState> {
    let (tx, rx) = watch::channel(self.check().await);

    tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = cancel.cancelled() => break,
          _ = tokio::time::sleep(self.interval) => {}
        }

        let state = tokio::select! {
          _ = cancel.cancelled() => break,
          state = self.check() => state,
        };
        tx.send_if_modified(|current| {
          if *current == state {
            false
          } else {
            *current = state;
            true
          }
        });
      }
      debug!("connectivity probe stopped");
    });

    rx
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::HttpResponse;
  use async_trait::async_trait;
  use std::sync::atomic::{AtomicBool, Ordering};

  struct Switch {
    up: AtomicBool,
  }

  #[async_trait]
  impl Transport for Switch {
    async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
      if self.up.load(Ordering::SeqCst) {
        Ok(HttpResponse::new(404, serde_json::Value::Null))
      } else {
        Err(TransportError::Connect("refused".into()))
      }
    }
  }

  #[tokio::test]
  async fn test_any_response_is_reachable() {
    let probe = ConnectivityProbe::new(
      Arc::new(Switch {
        up: AtomicBool::new(true),
      }),
      "http://api.test/health",
    );
    assert!(probe.check().await.is_online());
  }

  #[tokio::test(start_paused = true)]
  async fn test_spawned_probe_publishes_changes() {
    let switch = Arc::new(Switch {
      up: AtomicBool::new(false),
    });
    let cancel = CancellationToken::new();
    let mut rx = ConnectivityProbe::new(switch.clone(), "http://api.test/health")
      .with_interval(Duration::from_secs(1))
      .spawn(cancel.clone())
      .await;

    assert_eq!(*rx.borrow_and_update(), NetworkState::offline());

    switch.up.store(true, Ordering::SeqCst);
    rx.changed().await.unwrap();
    assert!(rx.borrow_and_update().is_online());

    cancel.cancel();
  }
}
