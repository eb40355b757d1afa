//! Cache keys derived from requests.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Derive a stable cache key for a request that has no explicit one.
///
/// The method is upper-cased and the URL trimmed so equivalent requests hash
/// the same. `serde_json` maps are ordered, so params hash deterministically.
pub fn request_cache_key(method: &str, url: &str, params: Option<&Value>) -> String {
  let input = format!(
    "{}:{}:{}",
    method.to_uppercase(),
    url.trim(),
    params.map(Value::to_string).unwrap_or_default()
  );

  // SHA256 hash for stable, fixed-length keys
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  format!("req_{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_key_is_stable_and_normalized() {
    let a = request_cache_key("get", " /patients/1 ", Some(&json!({"a": 1, "b": 2})));
    let b = request_cache_key("GET", "/patients/1", Some(&json!({"b": 2, "a": 1})));
    assert_eq!(a, b);
    assert!(a.starts_with("req_"));
  }

  #[test]
  fn test_params_change_key() {
    let a = request_cache_key("GET", "/appointments", Some(&json!({"page": 1})));
    let b = request_cache_key("GET", "/appointments", Some(&json!({"page": 2})));
    assert_ne!(a, b);
  }
}
