//! Single-flight execution: concurrent callers for the same key share one
//! in-flight future and all observe its output.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

type Flights<K, V> = Arc<Mutex<HashMap<K, (u64, Shared<BoxFuture<'static, V>>)>>>;

/// Deduplicates concurrent work by key.
///
/// The shared future is driven on its own task, so it runs to completion
/// even if every caller stops waiting for it.
pub struct SingleFlight<K, V: Clone> {
  flights: Flights<K, V>,
  next_id: AtomicU64,
}

impl<K, V> SingleFlight<K, V>
where
  K: Eq + Hash + Clone + Send + 'static,
  V: Clone + Send + Sync + 'static,
{
  pub fn new() -> Self {
    Self {
      flights: Arc::new(Mutex::new(HashMap::new())),
      next_id: AtomicU64::new(0),
    }
  }

  /// Join the flight for `key`, starting it with `start` if none is running.
  pub async fn run<F>(&self, key: K, start: F) -> V
  where
    F: FnOnce() -> BoxFuture<'static, V>,
  {
    let (id, flight) = {
      let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
      match flights.get(&key) {
        Some((id, flight)) => (*id, flight.clone()),
        None => {
          let id = self.next_id.fetch_add(1, Ordering::Relaxed);
          let flight = start().shared();
          flights.insert(key.clone(), (id, flight.clone()));

          let driver = flight.clone();
          let registry = Arc::clone(&self.flights);
          let driver_key = key.clone();
          tokio::spawn(async move {
            driver.await;
            finish(&registry, &driver_key, id);
          });

          (id, flight)
        }
      }
    };

    let output = flight.await;
    finish(&self.flights, &key, id);
    output
  }

  /// Whether a flight for `key` is currently running.
  pub fn in_flight(&self, key: &K) -> bool {
    self
      .flights
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .contains_key(key)
  }
}

impl<K, V> Default for SingleFlight<K, V>
where
  K: Eq + Hash + Clone + Send + 'static,
  V: Clone + Send + Sync + 'static,
{
  fn default() -> Self {
    Self::new()
  }
}

/// Remove the flight for `key` if it is still the one identified by `id`.
fn finish<K: Eq + Hash, V: Clone>(flights: &Flights<K, V>, key: &K, id: u64) {
  let mut flights = flights.lock().unwrap_or_else(PoisonError::into_inner);
  if flights.get(key).map(|(current, _)| *current == id) == Some(true) {
    flights.remove(key);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;
  use std::time::Duration;

  #[tokio::test]
  async fn test_concurrent_callers_share_one_execution() {
    let flight: Arc<SingleFlight<&'static str, u32>> = Arc::new(SingleFlight::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..5 {
      let flight = flight.clone();
      let calls = calls.clone();
      handles.push(tokio::spawn(async move {
        flight
          .run("token", move || {
            async move {
              calls.fetch_add(1, Ordering::SeqCst);
              tokio::time::sleep(Duration::from_millis(50)).await;
              42
            }
            .boxed()
          })
          .await
      }));
    }

    for handle in handles {
      assert_eq!(handle.await.unwrap(), 42);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!flight.in_flight(&"token"));
  }

  #[tokio::test]
  async fn test_sequential_calls_run_again() {
    let flight: SingleFlight<u8, usize> = SingleFlight::new();
    let calls = Arc::new(AtomicUsize::new(0));

    for expected in 1..=2 {
      let calls = calls.clone();
      let out = flight
        .run(1, move || async move { calls.fetch_add(1, Ordering::SeqCst) + 1 }.boxed())
        .await;
      assert_eq!(out, expected);
    }
  }

  #[tokio::test]
  async fn test_flight_completes_after_caller_gives_up() {
    let flight: Arc<SingleFlight<u8, ()>> = Arc::new(SingleFlight::new());
    let done = Arc::new(AtomicUsize::new(0));

    let done_clone = done.clone();
    let waiting = flight.run(7, move || {
      async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        done_clone.fetch_add(1, Ordering::SeqCst);
      }
      .boxed()
    });
    // Caller stops waiting almost immediately
    let _ = tokio::time::timeout(Duration::from_millis(5), waiting).await;

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert!(!flight.in_flight(&7));
  }
}
