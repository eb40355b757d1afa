//! Cache entry and its persisted layouts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Namespace for entries written by this crate.
pub(crate) const CACHE_PREFIX: &str = "cache_";

/// Namespace used by the older `{data, timestamp, expiresAt}` layout.
pub(crate) const LEGACY_CACHE_PREFIX: &str = "api_cache_";

/// A cached value together with its lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
  /// Logical key, without namespace prefix
  pub key: String,
  pub data: T,
  pub created_at: DateTime<Utc>,
  /// Always later than `created_at`
  pub expires_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
  /// Whether the entry is past its expiry at `now`.
  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    now > self.expires_at
  }
}

/// On-disk representation. `expiresAt` is accepted for legacy entries.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StoredEntry<T> {
  pub data: T,
  pub timestamp: i64,
  #[serde(alias = "expiresAt")]
  pub expiry: i64,
}

impl<T> StoredEntry<T> {
  pub fn into_entry(self, key: &str) -> Option<CacheEntry<T>> {
    Some(CacheEntry {
      key: key.to_string(),
      data: self.data,
      created_at: DateTime::from_timestamp_millis(self.timestamp)?,
      expires_at: DateTime::from_timestamp_millis(self.expiry)?,
    })
  }
}

/// Timestamps only; used when scanning for eviction without decoding payloads.
#[derive(Debug, Deserialize)]
pub(crate) struct EntryMeta {
  pub timestamp: i64,
  #[serde(alias = "expiresAt")]
  pub expiry: i64,
}

pub(crate) fn storage_key(key: &str) -> String {
  format!("{}{}", CACHE_PREFIX, key)
}

pub(crate) fn legacy_storage_key(key: &str) -> String {
  format!("{}{}", LEGACY_CACHE_PREFIX, key)
}

/// Strip either namespace prefix, returning the logical key.
pub(crate) fn logical_key(storage_key: &str) -> Option<&str> {
  storage_key
    .strip_prefix(CACHE_PREFIX)
    .or_else(|| storage_key.strip_prefix(LEGACY_CACHE_PREFIX))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_legacy_layout_parses() {
    let raw = r#"{"data":{"name":"Ada"},"timestamp":1700000000000,"expiresAt":1700000300000}"#;
    let stored: StoredEntry<serde_json::Value> = serde_json::from_str(raw).unwrap();
    let entry = stored.into_entry("profile").unwrap();

    assert_eq!(entry.key, "profile");
    assert_eq!(entry.data["name"], "Ada");
    assert_eq!(
      (entry.expires_at - entry.created_at).num_milliseconds(),
      300_000
    );
  }

  #[test]
  fn test_logical_key_strips_both_namespaces() {
    assert_eq!(logical_key("cache_profile"), Some("profile"));
    assert_eq!(logical_key("api_cache_profile"), Some("profile"));
    assert_eq!(logical_key("authToken"), None);
  }
}
