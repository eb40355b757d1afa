use serde::{Deserialize, Serialize};
use std::fmt;

/// Last observed connectivity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
  pub connected: bool,
  /// `None` while reachability has not been determined
  pub reachable: Option<bool>,
  /// Connection type as reported by the source ("wifi", "http", "none", ...)
  pub kind: String,
}

impl NetworkState {
  pub fn online(kind: impl Into<String>) -> Self {
    Self {
      connected: true,
      reachable: Some(true),
      kind: kind.into(),
    }
  }

  pub fn offline() -> Self {
    Self {
      connected: false,
      reachable: Some(false),
      kind: "none".to_string(),
    }
  }

  /// Connected, reachability not yet known.
  pub fn unknown(kind: impl Into<String>) -> Self {
    Self {
      connected: true,
      reachable: None,
      kind: kind.into(),
    }
  }

  /// Unknown reachability counts as offline.
  pub fn is_online(&self) -> bool {
    self.connected && self.reachable == Some(true)
  }
}

impl Default for NetworkState {
  fn default() -> Self {
    Self {
      connected: false,
      reachable: None,
      kind: "unknown".to_string(),
    }
  }
}

impl fmt::Display for NetworkState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let reachable = match self.reachable {
      Some(true) => "reachable",
      Some(false) => "unreachable",
      None => "reachability unknown",
    };
    write!(
      f,
      "{} ({}, {})",
      if self.is_online() { "online" } else { "offline" },
      self.kind,
      reachable
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_unknown_reachability_is_offline() {
    assert!(!NetworkState::unknown("wifi").is_online());
    assert!(!NetworkState::default().is_online());
    assert!(!NetworkState::offline().is_online());
    assert!(NetworkState::online("wifi").is_online());
  }

  #[test]
  fn test_connected_but_unreachable_is_offline() {
    let state = NetworkState {
      connected: true,
      reachable: Some(false),
      kind: "cellular".into(),
    };
    assert!(!state.is_online());
    assert_eq!(state.to_string(), "offline (cellular, unreachable)");
  }
}
