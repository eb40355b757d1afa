//! Connectivity tracking and the offline request queue.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::{PendingQueue, PendingRequest};
use super::state::NetworkState;
use crate::api::{should_retry, ApiError, ApiResponse, RequestDescriptor};
use crate::store::PersistentStore;

type Outcome = Result<ApiResponse, ApiError>;

/// Wait before another pass when a drain requeued anything while online.
pub const REQUEUE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Re-issues a queued request once connectivity returns.
#[async_trait]
pub trait PendingReplay: Send + Sync {
  async fn replay(&self, request: &PendingRequest) -> Outcome;
}

/// A queued request the caller can wait on.
#[derive(Debug)]
pub struct PendingTicket {
  pub id: String,
  /// Resolved when a drain sends the request or gives up on it
  pub outcome: oneshot::Receiver<Outcome>,
}

/// Result of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub sent: usize,
  /// Failed with a retryable error and went back to the tail
  pub requeued: usize,
  /// Failed with a non-retryable error, or could not be replayed at all
  pub dropped: usize,
}

struct MonitorInner {
  state: RwLock<NetworkState>,
  queue: Mutex<PendingQueue>,
  waiters: Mutex<HashMap<String, oneshot::Sender<Outcome>>>,
  store: Arc<dyn PersistentStore>,
  replayer: RwLock<Option<Weak<dyn PendingReplay>>>,
  draining: tokio::sync::Mutex<()>,
  /// Signalled by a pass that put requests back on the queue
  requeued: Notify,
  shutdown: CancellationToken,
  task: Mutex<Option<JoinHandle<()>>>,
}

/// Tracks [`NetworkState`] from a connectivity source and owns the offline queue.
///
/// The queue is restored from the store on construction and persisted after
/// every change. An offline→online transition drains it in FIFO order through
/// the registered [`PendingReplay`]. Requests requeued by a pass are tried
/// again after [`REQUEUE_RETRY_DELAY`] while connectivity holds.
#[derive(Clone)]
pub struct NetworkMonitor {
  inner: Arc<MonitorInner>,
}

impl NetworkMonitor {
  pub fn new(store: Arc<dyn PersistentStore>, capacity: usize) -> Self {
    let queue = match PendingQueue::restore(store.as_ref(), capacity) {
      Ok(queue) => {
        if !queue.is_empty() {
          info!(pending = queue.len(), "restored offline queue");
        }
        queue
      }
      Err(e) => {
        warn!(error = %e, "failed to restore offline queue, starting empty");
        PendingQueue::new(capacity)
      }
    };

    Self {
      inner: Arc::new(MonitorInner {
        state: RwLock::new(NetworkState::default()),
        queue: Mutex::new(queue),
        waiters: Mutex::new(HashMap::new()),
        store,
        replayer: RwLock::new(None),
        draining: tokio::sync::Mutex::new(()),
        requeued: Notify::new(),
        shutdown: CancellationToken::new(),
        task: Mutex::new(None),
      }),
    }
  }

  /// Register the component that replays queued requests.
  pub fn set_replayer(&self, replayer: Weak<dyn PendingReplay>) {
    *self
      .inner
      .replayer
      .write()
      .unwrap_or_else(PoisonError::into_inner) = Some(replayer);
  }

  /// Subscribe to `source`. Only the first call has an effect.
  pub fn start(&self, mut source: watch::Receiver<NetworkState>) {
    let mut task = self.inner.task.lock().unwrap_or_else(PoisonError::into_inner);
    if task.is_some() {
      warn!("network monitor already subscribed");
      return;
    }

    // The first state is applied before returning so callers see it at once
    let initial = source.borrow_and_update().clone();
    let drain_now = self.inner.apply(initial);

    let inner = Arc::clone(&self.inner);
    *task = Some(tokio::spawn(async move {
      if drain_now {
        inner.drain_and_log().await;
      }

      let mut retry_at: Option<Instant> = None;
      loop {
        let retry = async move {
          match retry_at {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
          }
        };
        tokio::select! {
          _ = inner.shutdown.cancelled() => break,
          _ = inner.requeued.notified() => {
            retry_at.get_or_insert_with(|| Instant::now() + REQUEUE_RETRY_DELAY);
          }
          _ = retry => {
            retry_at = None;
            if inner.current().is_online() {
              debug!("retrying requeued requests");
              inner.drain_and_log().await;
            }
          }
          changed = source.changed() => {
            if changed.is_err() {
              debug!("connectivity source closed");
              break;
            }
            let state = source.borrow_and_update().clone();
            inner.observe(state).await;
          }
        }
      }
      debug!("network monitor stopped");
    }));
  }

  /// Stop the subscription task and wait for it to finish.
  pub async fn shutdown(&self) {
    self.inner.shutdown.cancel();
    let task = self
      .inner
      .task
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    if let Some(task) = task {
      if let Err(e) = task.await {
        warn!(error = %e, "network monitor task failed");
      }
    }
  }

  pub fn state(&self) -> NetworkState {
    self.inner.current()
  }

  pub fn is_online(&self) -> bool {
    self.inner.current().is_online()
  }

  pub fn connection_kind(&self) -> String {
    self.inner.current().kind
  }

  /// Queue `descriptor` until connectivity returns.
  pub fn add_pending_request(&self, descriptor: &RequestDescriptor) -> PendingTicket {
    let request = PendingRequest::from_descriptor(descriptor);
    let id = request.id.clone();
    let (tx, rx) = oneshot::channel();
    self.inner.waiters().insert(id.clone(), tx);

    let (evicted, pending) = {
      let mut queue = self.inner.queue();
      let evicted = queue.push(request);
      self.inner.persist(&queue);
      (evicted, queue.len())
    };
    info!(id = %id, method = %descriptor.method, url = %descriptor.url, pending, "queued request while offline");

    if let Some(evicted) = evicted {
      warn!(id = %evicted.id, url = %evicted.url, "offline queue full, dropped oldest request");
      self.inner.resolve(
        &evicted.id,
        Err(ApiError::network("Offline queue is full; request was dropped")),
      );
    }

    // Connectivity may have returned between the caller's check and now
    if self.is_online() {
      let monitor = self.clone();
      tokio::spawn(async move {
        monitor.drain_pending().await;
      });
    }

    PendingTicket { id, outcome: rx }
  }

  pub fn pending_requests(&self) -> Vec<PendingRequest> {
    self.inner.queue().snapshot()
  }

  /// Withdraw one queued request. Its waiter is dropped without a result.
  pub fn remove_pending_request(&self, id: &str) -> bool {
    let removed = {
      let mut queue = self.inner.queue();
      let removed = queue.remove(id).is_some();
      if removed {
        self.inner.persist(&queue);
      }
      removed
    };
    self.inner.waiters().remove(id);
    removed
  }

  /// Discard every queued request; waiters are resolved as cancelled.
  pub fn clear_pending_requests(&self) {
    let cleared = {
      let mut queue = self.inner.queue();
      let cleared = queue.take_all();
      self.inner.persist(&queue);
      cleared
    };
    info!(cleared = cleared.len(), "offline queue cleared");
    for request in cleared {
      self.inner.resolve(
        &request.id,
        Err(ApiError::cancelled().with_cause("offline queue cleared")),
      );
    }
  }

  /// Replay every queued request once, in enqueue order.
  ///
  /// Concurrent calls wait for the running pass and then run their own.
  pub async fn drain_pending(&self) -> DrainReport {
    self.inner.drain().await
  }
}

impl MonitorInner {
  fn current(&self) -> NetworkState {
    self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
  }

  fn queue(&self) -> std::sync::MutexGuard<'_, PendingQueue> {
    self.queue.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn waiters(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Outcome>>> {
    self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn persist(&self, queue: &PendingQueue) {
    if let Err(e) = queue.persist(self.store.as_ref()) {
      warn!(error = %e, "failed to persist offline queue");
    }
  }

  fn resolve(&self, id: &str, outcome: Outcome) {
    if let Some(waiter) = self.waiters().remove(id) {
      // The caller may have stopped waiting
      let _ = waiter.send(outcome);
    }
  }

  /// Record `next`; true when this is an offline→online transition.
  fn apply(&self, next: NetworkState) -> bool {
    let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
    if *state == next {
      return false;
    }
    let was_online = state.is_online();
    info!(state = %next, "connectivity changed");
    let came_online = !was_online && next.is_online();
    *state = next;
    came_online
  }

  async fn observe(&self, next: NetworkState) {
    if self.apply(next) {
      self.drain_and_log().await;
    }
  }

  async fn drain_and_log(&self) {
    let report = self.drain().await;
    if report != DrainReport::default() {
      info!(
        sent = report.sent,
        requeued = report.requeued,
        dropped = report.dropped,
        "offline queue drained"
      );
    }
  }

  async fn drain(&self) -> DrainReport {
    let _pass = self.draining.lock().await;
    let mut report = DrainReport::default();

    let replayer = self
      .replayer
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .as_ref()
      .and_then(Weak::upgrade);
    let Some(replayer) = replayer else {
      warn!("no replayer registered, offline queue left untouched");
      return report;
    };

    let batch = self.queue().len();
    if batch == 0 {
      return report;
    }
    debug!(batch, "draining offline queue");

    for _ in 0..batch {
      if self.shutdown.is_cancelled() {
        break;
      }
      let Some(request) = self.queue().pop_front() else {
        break;
      };

      match replayer.replay(&request).await {
        Ok(response) => {
          debug!(id = %request.id, status = response.status, "replayed queued request");
          report.sent += 1;
          self.resolve(&request.id, Ok(response));
        }
        Err(err) if should_retry(&err) => {
          debug!(id = %request.id, error = %err, "replay failed, requeueing");
          report.requeued += 1;
          let evicted = self.queue().push(request);
          if let Some(evicted) = evicted {
            report.dropped += 1;
            self.resolve(
              &evicted.id,
              Err(ApiError::network("Offline queue is full; request was dropped")),
            );
          }
        }
        Err(err) => {
          warn!(id = %request.id, url = %request.url, error = %err, "dropping queued request after non-retryable failure");
          report.dropped += 1;
          self.resolve(&request.id, Err(err));
        }
      }

      let queue = self.queue();
      self.persist(&queue);
    }

    if report.requeued > 0 {
      self.requeued.notify_one();
    }
    report
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::{HttpMethod, NetworkErrorKind};
  use crate::network::QUEUE_KEY;
  use crate::store::MemoryStore;
  use serde_json::{json, Value};
  use std::collections::VecDeque;
  use std::time::Duration;

  /// Records replays and answers from a script (default: success).
  #[derive(Default)]
  struct RecordingReplay {
    seen: Mutex<Vec<String>>,
    outcomes: Mutex<VecDeque<Outcome>>,
  }

  impl RecordingReplay {
    fn scripted(outcomes: Vec<Outcome>) -> Arc<Self> {
      Arc::new(Self {
        outcomes: Mutex::new(outcomes.into()),
        ..Default::default()
      })
    }

    fn seen(&self) -> Vec<String> {
      self.seen.lock().unwrap().clone()
    }
  }

  #[async_trait]
  impl PendingReplay for RecordingReplay {
    async fn replay(&self, request: &PendingRequest) -> Outcome {
      self.seen.lock().unwrap().push(request.url.clone());
      self
        .outcomes
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| Ok(ApiResponse::new(200, Value::Null)))
    }
  }

  fn monitor_with(replay: &Arc<RecordingReplay>) -> (Arc<MemoryStore>, NetworkMonitor) {
    let store = Arc::new(MemoryStore::new());
    let monitor = NetworkMonitor::new(store.clone(), 100);
    let weak: Weak<RecordingReplay> = Arc::downgrade(replay);
    monitor.set_replayer(weak);
    (store, monitor)
  }

  async fn settle() {
    for _ in 0..20 {
      tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }

  #[tokio::test]
  async fn test_state_follows_source() {
    let replay = Arc::new(RecordingReplay::default());
    let (_, monitor) = monitor_with(&replay);
    let (tx, rx) = watch::channel(NetworkState::unknown("wifi"));
    monitor.start(rx);
    settle().await;
    assert!(!monitor.is_online());
    assert_eq!(monitor.connection_kind(), "wifi");

    tx.send(NetworkState::online("cellular")).unwrap();
    settle().await;
    assert!(monitor.is_online());
    assert_eq!(monitor.connection_kind(), "cellular");

    monitor.shutdown().await;
  }

  #[tokio::test]
  async fn test_queued_requests_replay_in_order_on_reconnect() {
    let replay = Arc::new(RecordingReplay::default());
    let (store, monitor) = monitor_with(&replay);
    let (tx, rx) = watch::channel(NetworkState::offline());
    monitor.start(rx);
    settle().await;

    let first = monitor.add_pending_request(&RequestDescriptor::post("/a", json!({})));
    let second = monitor.add_pending_request(&RequestDescriptor::delete("/b"));
    assert!(store.get(QUEUE_KEY).unwrap().is_some());
    assert!(replay.seen().is_empty());

    tx.send(NetworkState::online("wifi")).unwrap();

    assert_eq!(first.outcome.await.unwrap().unwrap().status, 200);
    assert_eq!(second.outcome.await.unwrap().unwrap().status, 200);
    assert_eq!(replay.seen(), vec!["/a", "/b"]);
    assert!(monitor.pending_requests().is_empty());
    assert!(store.get(QUEUE_KEY).unwrap().is_none());

    monitor.shutdown().await;
  }

  #[tokio::test]
  async fn test_retryable_failure_requeues_and_client_error_drops() {
    let replay = RecordingReplay::scripted(vec![
      Err(ApiError::network("still down")),
      Err(ApiError::from_response(400, &json!({"message": "bad"}))),
    ]);
    let (_, monitor) = monitor_with(&replay);
    let mut kept = monitor.add_pending_request(&RequestDescriptor::post("/kept", json!({})));
    let dropped = monitor.add_pending_request(&RequestDescriptor::post("/dropped", json!({})));

    let report = monitor.drain_pending().await;

    assert_eq!(
      report,
      DrainReport {
        sent: 0,
        requeued: 1,
        dropped: 1
      }
    );
    let err = dropped.outcome.await.unwrap().unwrap_err();
    assert_eq!(err.kind, NetworkErrorKind::Validation);
    assert!(kept.outcome.try_recv().is_err());
    let pending = monitor.pending_requests();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].url, "/kept");

    // Next pass succeeds and resolves the original waiter
    let report = monitor.drain_pending().await;
    assert_eq!(report.sent, 1);
    assert_eq!(kept.outcome.await.unwrap().unwrap().status, 200);
  }

  #[tokio::test(start_paused = true)]
  async fn test_requeued_request_is_retried_while_online() {
    let replay = RecordingReplay::scripted(vec![Err(ApiError::from_response(503, &Value::Null))]);
    let (_, monitor) = monitor_with(&replay);
    let (tx, rx) = watch::channel(NetworkState::offline());
    monitor.start(rx);
    let ticket = monitor.add_pending_request(&RequestDescriptor::post("/vitals", json!({"bpm": 61})));

    let started = Instant::now();
    tx.send(NetworkState::online("wifi")).unwrap();

    assert_eq!(ticket.outcome.await.unwrap().unwrap().status, 200);
    assert!(started.elapsed() >= REQUEUE_RETRY_DELAY);
    assert_eq!(replay.seen(), vec!["/vitals", "/vitals"]);
    assert!(monitor.pending_requests().is_empty());
    monitor.shutdown().await;
  }

  #[tokio::test]
  async fn test_overflow_resolves_evicted_waiter() {
    let store = Arc::new(MemoryStore::new());
    let monitor = NetworkMonitor::new(store, 2);

    let oldest = monitor.add_pending_request(&RequestDescriptor::post("/1", json!({})));
    monitor.add_pending_request(&RequestDescriptor::post("/2", json!({})));
    monitor.add_pending_request(&RequestDescriptor::post("/3", json!({})));

    let err = oldest.outcome.await.unwrap().unwrap_err();
    assert_eq!(err.code, "NETWORK_ERROR");
    let urls: Vec<_> = monitor.pending_requests().into_iter().map(|r| r.url).collect();
    assert_eq!(urls, vec!["/2", "/3"]);
  }

  #[tokio::test]
  async fn test_restored_queue_drains_on_first_online_state() {
    let store = Arc::new(MemoryStore::new());
    {
      let previous = NetworkMonitor::new(store.clone(), 100);
      previous.add_pending_request(&RequestDescriptor::patch("/restored", json!({"x": 1})));
    }

    let replay = Arc::new(RecordingReplay::default());
    let monitor = NetworkMonitor::new(store, 100);
    let weak: Weak<RecordingReplay> = Arc::downgrade(&replay);
    monitor.set_replayer(weak);
    assert_eq!(monitor.pending_requests()[0].method, HttpMethod::Patch);

    let (_tx, rx) = watch::channel(NetworkState::online("wifi"));
    monitor.start(rx);
    settle().await;

    assert_eq!(replay.seen(), vec!["/restored"]);
    assert!(monitor.pending_requests().is_empty());
    monitor.shutdown().await;
  }

  #[tokio::test]
  async fn test_clear_cancels_waiters() {
    let store = Arc::new(MemoryStore::new());
    let monitor = NetworkMonitor::new(store, 10);
    let ticket = monitor.add_pending_request(&RequestDescriptor::post("/x", json!({})));

    monitor.clear_pending_requests();

    assert!(ticket.outcome.await.unwrap().unwrap_err().is_cancelled());
    assert!(monitor.pending_requests().is_empty());
  }

  #[tokio::test]
  async fn test_drain_without_replayer_leaves_queue() {
    let store = Arc::new(MemoryStore::new());
    let monitor = NetworkMonitor::new(store, 10);
    let ticket = monitor.add_pending_request(&RequestDescriptor::post("/x", json!({})));

    assert_eq!(monitor.drain_pending().await, DrainReport::default());
    assert_eq!(monitor.pending_requests().len(), 1);
    assert!(monitor.remove_pending_request(&ticket.id));
    assert!(monitor.pending_requests().is_empty());
  }
}
