//! Access/refresh token pair and its persisted mirrors.

use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::store::{get_json, set_json, PersistentStore};

/// Store key holding the raw access token.
pub const ACCESS_TOKEN_KEY: &str = "authToken";

/// Store key holding the raw refresh token.
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

/// Combined record read by older consumers: a JSON object whose `token` and
/// `refreshToken` fields mirror the keys above.
pub const USER_DATA_KEY: &str = "@user_data";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthToken {
  pub access_token: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub refresh_token: Option<String>,
}

impl AuthToken {
  pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
    Self {
      access_token: access_token.into(),
      refresh_token,
    }
  }

  /// Value for the `Authorization` header.
  pub fn bearer(&self) -> String {
    format!("Bearer {}", self.access_token)
  }
}

fn get_string(store: &dyn PersistentStore, key: &str) -> Result<Option<String>> {
  Ok(
    store
      .get(key)?
      .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
      .filter(|s| !s.is_empty()),
  )
}

/// Load the persisted token, preferring the dedicated keys over `@user_data`.
pub(crate) fn load(store: &dyn PersistentStore) -> Result<Option<AuthToken>> {
  let user_data: Option<Value> = get_json(store, USER_DATA_KEY).unwrap_or(None);
  let mirrored = |field: &str| {
    user_data
      .as_ref()
      .and_then(|v| v.get(field))
      .and_then(Value::as_str)
      .map(String::from)
  };

  let access = get_string(store, ACCESS_TOKEN_KEY)?.or_else(|| mirrored("token"));
  let refresh = get_string(store, REFRESH_TOKEN_KEY)?.or_else(|| mirrored("refreshToken"));

  Ok(access.map(|access_token| AuthToken {
    access_token,
    refresh_token: refresh,
  }))
}

/// Read only the refresh credential.
pub(crate) fn load_refresh_token(store: &dyn PersistentStore) -> Result<Option<String>> {
  Ok(load(store)?.and_then(|t| t.refresh_token))
}

/// Persist `token` (or clear it) in every mirror.
pub(crate) fn persist(store: &dyn PersistentStore, token: Option<&AuthToken>) -> Result<()> {
  match token {
    Some(token) => {
      store.set(ACCESS_TOKEN_KEY, token.access_token.as_bytes())?;
      match &token.refresh_token {
        Some(refresh) => store.set(REFRESH_TOKEN_KEY, refresh.as_bytes())?,
        None => store.remove(REFRESH_TOKEN_KEY)?,
      }
    }
    None => {
      store.remove(ACCESS_TOKEN_KEY)?;
      store.remove(REFRESH_TOKEN_KEY)?;
    }
  }

  // Other fields of the combined record belong to the host application
  let mut record = match get_json::<Value>(store, USER_DATA_KEY) {
    Ok(Some(Value::Object(map))) => map,
    _ => Map::new(),
  };
  match token {
    Some(token) => {
      record.insert("token".into(), Value::String(token.access_token.clone()));
      match &token.refresh_token {
        Some(refresh) => {
          record.insert("refreshToken".into(), Value::String(refresh.clone()));
        }
        None => {
          record.remove("refreshToken");
        }
      }
    }
    None => {
      record.remove("token");
      record.remove("refreshToken");
    }
  }

  if record.is_empty() {
    store.remove(USER_DATA_KEY)
  } else {
    set_json(store, USER_DATA_KEY, &Value::Object(record))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::MemoryStore;
  use serde_json::json;

  #[test]
  fn test_persist_writes_every_mirror() {
    let store = MemoryStore::new();
    let token = AuthToken::new("access", Some("refresh".into()));

    persist(&store, Some(&token)).unwrap();

    assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap(), Some(b"access".to_vec()));
    assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap(), Some(b"refresh".to_vec()));
    let record: Value = get_json(&store, USER_DATA_KEY).unwrap().unwrap();
    assert_eq!(record, json!({"token": "access", "refreshToken": "refresh"}));
    assert_eq!(load(&store).unwrap(), Some(token));
  }

  #[test]
  fn test_clear_keeps_unrelated_user_data() {
    let store = MemoryStore::new();
    set_json(&store, USER_DATA_KEY, &json!({"name": "Ada", "token": "old"})).unwrap();
    persist(&store, Some(&AuthToken::new("new", None))).unwrap();

    persist(&store, None).unwrap();

    assert_eq!(load(&store).unwrap(), None);
    let record: Value = get_json(&store, USER_DATA_KEY).unwrap().unwrap();
    assert_eq!(record, json!({"name": "Ada"}));
  }

  #[test]
  fn test_load_falls_back_to_user_data() {
    let store = MemoryStore::new();
    set_json(&store, USER_DATA_KEY, &json!({"token": "a", "refreshToken": "r"})).unwrap();

    assert_eq!(load(&store).unwrap(), Some(AuthToken::new("a", Some("r".into()))));
    assert_eq!(load_refresh_token(&store).unwrap().as_deref(), Some("r"));
  }
}
