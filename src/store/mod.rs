//! Durable key/value storage used by the cache, the offline queue and the
//! credential mirror.
//!
//! Everything above this layer talks to a `PersistentStore` trait object so the
//! SQLite backend can be swapped for the in-memory one in tests or when the
//! client runs with `--ephemeral`.

mod memory;
mod sqlite;

use color_eyre::Result;

pub use memory::MemoryStore;
pub use sqlite::{default_data_dir, SqliteStore};

/// Byte-oriented key/value storage.
pub trait PersistentStore: Send + Sync {
  /// Read the raw value stored under `key`.
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

  /// Insert or overwrite the value stored under `key`.
  fn set(&self, key: &str, value: &[u8]) -> Result<()>;

  /// Delete `key`. Removing a missing key is not an error.
  fn remove(&self, key: &str) -> Result<()>;

  /// List every key currently stored.
  fn keys(&self) -> Result<Vec<String>>;
}

/// Read and deserialize a JSON value.
pub fn get_json<T: serde::de::DeserializeOwned>(
  store: &dyn PersistentStore,
  key: &str,
) -> Result<Option<T>> {
  match store.get(key)? {
    Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
    None => Ok(None),
  }
}

/// Serialize a value as JSON and store it.
pub fn set_json<T: serde::Serialize + ?Sized>(
  store: &dyn PersistentStore,
  key: &str,
  value: &T,
) -> Result<()> {
  let bytes = serde_json::to_vec(value)?;
  store.set(key, &bytes)
}
