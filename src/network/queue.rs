//! Durable FIFO of requests deferred while offline.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::api::{HttpMethod, RequestDescriptor};
use crate::store::{get_json, set_json, PersistentStore};

/// Store key holding the serialized queue.
pub const QUEUE_KEY: &str = "offline_queue";

/// Queue capacity when none is configured.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

/// A request waiting for connectivity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
  pub id: String,
  pub method: HttpMethod,
  pub url: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub payload: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cache_key: Option<String>,
  pub enqueued_at: DateTime<Utc>,
}

impl PendingRequest {
  pub fn from_descriptor(descriptor: &RequestDescriptor) -> Self {
    let enqueued_at = Utc::now();
    let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
    Self {
      id: format!("pending_{}_{}", enqueued_at.timestamp_millis(), seq),
      method: descriptor.method,
      url: descriptor.url.clone(),
      payload: descriptor.params.clone(),
      cache_key: descriptor.cache_key.clone(),
      enqueued_at,
    }
  }

  /// Descriptor used to replay this request.
  pub fn to_descriptor(&self) -> RequestDescriptor {
    RequestDescriptor::new(self.method, self.url.clone())
      .maybe_params(self.payload.clone())
      .maybe_cache_key(self.cache_key.clone())
  }
}

/// Bounded FIFO; pushing past capacity evicts the oldest entry.
#[derive(Debug)]
pub(crate) struct PendingQueue {
  items: VecDeque<PendingRequest>,
  capacity: usize,
}

impl PendingQueue {
  pub fn new(capacity: usize) -> Self {
    Self {
      items: VecDeque::new(),
      capacity: capacity.max(1),
    }
  }

  /// Load the persisted queue, trimming it to `capacity` from the front.
  pub fn restore(store: &dyn PersistentStore, capacity: usize) -> Result<Self> {
    let mut queue = Self::new(capacity);
    let items: Vec<PendingRequest> = get_json(store, QUEUE_KEY)?.unwrap_or_default();
    for item in items {
      queue.push(item);
    }
    Ok(queue)
  }

  pub fn persist(&self, store: &dyn PersistentStore) -> Result<()> {
    if self.items.is_empty() {
      return store.remove(QUEUE_KEY);
    }
    set_json(store, QUEUE_KEY, &self.items)
  }

  /// Append to the tail; returns the evicted head when over capacity.
  pub fn push(&mut self, request: PendingRequest) -> Option<PendingRequest> {
    self.items.push_back(request);
    if self.items.len() > self.capacity {
      self.items.pop_front()
    } else {
      None
    }
  }

  pub fn pop_front(&mut self) -> Option<PendingRequest> {
    self.items.pop_front()
  }

  pub fn remove(&mut self, id: &str) -> Option<PendingRequest> {
    let index = self.items.iter().position(|r| r.id == id)?;
    self.items.remove(index)
  }

  pub fn snapshot(&self) -> Vec<PendingRequest> {
    self.items.iter().cloned().collect()
  }

  pub fn take_all(&mut self) -> Vec<PendingRequest> {
    self.items.drain(..).collect()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::MemoryStore;
  use serde_json::json;

  fn request(url: &str) -> PendingRequest {
    PendingRequest::from_descriptor(&RequestDescriptor::post(url, json!({"n": url})))
  }

  #[test]
  fn test_overflow_evicts_oldest() {
    let mut queue = PendingQueue::new(2);
    assert!(queue.push(request("/a")).is_none());
    assert!(queue.push(request("/b")).is_none());

    let evicted = queue.push(request("/c")).unwrap();

    assert_eq!(evicted.url, "/a");
    let urls: Vec<_> = queue.snapshot().into_iter().map(|r| r.url).collect();
    assert_eq!(urls, vec!["/b", "/c"]);
  }

  #[test]
  fn test_persist_and_restore_keeps_order() {
    let store = MemoryStore::new();
    let mut queue = PendingQueue::new(10);
    for url in ["/1", "/2", "/3"] {
      queue.push(request(url));
    }
    queue.persist(&store).unwrap();

    let restored = PendingQueue::restore(&store, 2).unwrap();

    let urls: Vec<_> = restored.snapshot().into_iter().map(|r| r.url).collect();
    assert_eq!(urls, vec!["/2", "/3"]);
  }

  #[test]
  fn test_empty_queue_removes_key() {
    let store = MemoryStore::new();
    let mut queue = PendingQueue::new(10);
    queue.push(request("/1"));
    queue.persist(&store).unwrap();
    assert!(store.get(QUEUE_KEY).unwrap().is_some());

    queue.take_all();
    queue.persist(&store).unwrap();
    assert!(store.get(QUEUE_KEY).unwrap().is_none());
  }

  #[test]
  fn test_ids_are_unique_and_descriptor_round_trips() {
    let d = RequestDescriptor::put("/profile", json!({"name": "Ada"})).cache_key("profile");
    let a = PendingRequest::from_descriptor(&d);
    let b = PendingRequest::from_descriptor(&d);
    assert_ne!(a.id, b.id);

    let replay = a.to_descriptor();
    assert_eq!(replay.method, HttpMethod::Put);
    assert_eq!(replay.params, Some(json!({"name": "Ada"})));
    assert_eq!(replay.cache_key.as_deref(), Some("profile"));
  }
}
