//! Cache store: TTL entries with a size budget.

use chrono::Utc;
use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::entry::{
  legacy_storage_key, logical_key, storage_key, CacheEntry, EntryMeta, StoredEntry,
};
use crate::store::PersistentStore;

/// TTL applied when the caller does not supply one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Total bytes the cache namespace may occupy before a write triggers eviction.
pub const DEFAULT_MAX_SIZE: u64 = 50 * 1024 * 1024;

/// Occupancy of the cache namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub entries: usize,
  pub bytes: u64,
}

/// A cache entry as seen during a size scan.
struct ScannedEntry {
  storage_key: String,
  size: u64,
  meta: Option<EntryMeta>,
}

/// TTL cache over a [`PersistentStore`].
///
/// Cloning is cheap; clones share the same underlying store.
#[derive(Clone)]
pub struct CacheStore {
  store: Arc<dyn PersistentStore>,
  max_size: u64,
  default_ttl: Duration,
}

impl CacheStore {
  pub fn new(store: Arc<dyn PersistentStore>) -> Self {
    Self {
      store,
      max_size: DEFAULT_MAX_SIZE,
      default_ttl: DEFAULT_TTL,
    }
  }

  /// Set the size budget in bytes.
  pub fn with_max_size(mut self, max_size: u64) -> Self {
    self.max_size = max_size;
    self
  }

  /// Set the TTL used when `set` is called without one.
  pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
    self.default_ttl = ttl;
    self
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  /// Get the cached value for `key`, or `None` on miss, expiry or failure.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    self.get_entry(key).map(|entry| entry.data)
  }

  /// Like [`CacheStore::get`] but returns the entry with its timestamps.
  pub fn get_entry<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
    match self.try_get_entry(key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key = %key, error = %e, "cache read failed, treating as miss");
        None
      }
    }
  }

  /// Store `data` under `key` for `ttl` (or the default TTL).
  pub fn set<T: Serialize + ?Sized>(&self, key: &str, data: &T, ttl: Option<Duration>) {
    if let Err(e) = self.try_set(key, data, ttl) {
      warn!(key = %key, error = %e, "cache write failed");
    }
  }

  /// Remove `key` from both namespaces.
  pub fn remove(&self, key: &str) {
    for storage_key in [storage_key(key), legacy_storage_key(key)] {
      if let Err(e) = self.store.remove(&storage_key) {
        warn!(key = %storage_key, error = %e, "cache remove failed");
      }
    }
  }

  /// Remove every cache entry, including legacy ones.
  pub fn clear(&self) {
    let keys = match self.store.keys() {
      Ok(keys) => keys,
      Err(e) => {
        warn!(error = %e, "cache clear failed to list keys");
        return;
      }
    };

    let mut removed = 0usize;
    for key in keys.iter().filter(|k| logical_key(k).is_some()) {
      match self.store.remove(key) {
        Ok(()) => removed += 1,
        Err(e) => warn!(key = %key, error = %e, "cache remove failed"),
      }
    }
    debug!(removed, "cache cleared");
  }

  /// Logical keys of all cached entries (expired ones included until read).
  pub fn keys(&self) -> Vec<String> {
    match self.store.keys() {
      Ok(keys) => keys
        .iter()
        .filter_map(|k| logical_key(k))
        .map(String::from)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect(),
      Err(e) => {
        warn!(error = %e, "cache keys failed");
        Vec::new()
      }
    }
  }

  /// Current entry count and byte occupancy.
  pub fn stats(&self) -> CacheStats {
    match self.scan() {
      Ok(entries) => CacheStats {
        entries: entries.len(),
        bytes: entries.iter().map(|e| e.size).sum(),
      },
      Err(e) => {
        warn!(error = %e, "cache stats failed");
        CacheStats::default()
      }
    }
  }

  fn try_get_entry<T: DeserializeOwned>(&self, key: &str) -> Result<Option<CacheEntry<T>>> {
    for storage_key in [storage_key(key), legacy_storage_key(key)] {
      let Some(bytes) = self.store.get(&storage_key)? else {
        continue;
      };

      let stored: StoredEntry<T> = serde_json::from_slice(&bytes)?;
      let Some(entry) = stored.into_entry(key) else {
        warn!(key = %storage_key, "cache entry has invalid timestamps, removing");
        self.store.remove(&storage_key)?;
        return Ok(None);
      };

      if entry.is_expired_at(Utc::now()) {
        debug!(key = %key, "cache entry expired");
        self.store.remove(&storage_key)?;
        return Ok(None);
      }

      return Ok(Some(entry));
    }

    Ok(None)
  }

  fn try_set<T: Serialize + ?Sized>(
    &self,
    key: &str,
    data: &T,
    ttl: Option<Duration>,
  ) -> Result<()> {
    let ttl = ttl
      .unwrap_or(self.default_ttl)
      .max(Duration::from_millis(1));
    let timestamp = Utc::now().timestamp_millis();
    let expiry = timestamp.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));

    let bytes = serde_json::to_vec(&StoredEntry {
      data,
      timestamp,
      expiry,
    })?;

    let target = storage_key(key);
    self.make_room(&target, bytes.len() as u64)?;
    self.store.set(&target, &bytes)?;

    debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "cache entry stored");
    Ok(())
  }

  /// Evict entries so that writing `incoming` bytes under `target` fits the budget.
  ///
  /// Expired entries go first. If live entries alone exceed the budget, the
  /// oldest are evicted until the write fits or nothing else is left.
  fn make_room(&self, target: &str, incoming: u64) -> Result<()> {
    let mut entries = self.scan()?;
    entries.retain(|e| e.storage_key != target);

    let mut occupied: u64 = entries.iter().map(|e| e.size).sum();
    if occupied + incoming <= self.max_size {
      return Ok(());
    }

    let now = Utc::now().timestamp_millis();
    let mut expired = 0usize;
    let mut live = Vec::with_capacity(entries.len());
    for entry in entries {
      let is_expired = entry.meta.as_ref().map(|m| m.expiry < now).unwrap_or(true);
      if is_expired {
        self.store.remove(&entry.storage_key)?;
        occupied = occupied.saturating_sub(entry.size);
        expired += 1;
      } else {
        live.push(entry);
      }
    }
    if expired > 0 {
      debug!(expired, "evicted expired cache entries");
    }

    if occupied + incoming <= self.max_size {
      return Ok(());
    }

    live.sort_by_key(|e| e.meta.as_ref().map(|m| m.timestamp).unwrap_or(i64::MIN));
    let mut evicted = 0usize;
    for entry in live {
      if occupied + incoming <= self.max_size {
        break;
      }
      self.store.remove(&entry.storage_key)?;
      occupied = occupied.saturating_sub(entry.size);
      evicted += 1;
    }
    if evicted > 0 {
      warn!(evicted, max_size = self.max_size, "cache over budget, evicted oldest entries");
    }

    Ok(())
  }

  fn scan(&self) -> Result<Vec<ScannedEntry>> {
    let mut entries = Vec::new();
    for key in self.store.keys()? {
      if logical_key(&key).is_none() {
        continue;
      }
      let Some(bytes) = self.store.get(&key)? else {
        continue;
      };
      entries.push(ScannedEntry {
        size: bytes.len() as u64,
        meta: serde_json::from_slice(&bytes).ok(),
        storage_key: key,
      });
    }
    Ok(entries)
  }
}

impl std::fmt::Debug for CacheStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CacheStore")
      .field("max_size", &self.max_size)
      .field("default_ttl", &self.default_ttl)
      .finish_non_exhaustive()
  }
}
