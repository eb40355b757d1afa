use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::{DEFAULT_RETRIES, DEFAULT_RETRY_DELAY, DEFAULT_TIMEOUT};
use crate::auth::{DEFAULT_MAX_REFRESH_ATTEMPTS, DEFAULT_REFRESH_BACKOFF};
use crate::cache::{DEFAULT_MAX_SIZE, DEFAULT_TTL};
use crate::network::{DEFAULT_PROBE_INTERVAL, DEFAULT_QUEUE_CAPACITY};
use crate::store::default_data_dir;

/// Environment variable seeding the access token when none is persisted.
pub const ACCESS_TOKEN_ENV: &str = "CARELINK_ACCESS_TOKEN";

/// Environment variable seeding the refresh token when none is persisted.
pub const REFRESH_TOKEN_ENV: &str = "CARELINK_REFRESH_TOKEN";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub auth: AuthSection,
  /// Overrides the platform data directory (SQLite store and logs)
  pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub base_url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  #[serde(default = "default_retries")]
  pub retries: u32,
  #[serde(default = "default_retry_delay_ms")]
  pub retry_delay_ms: u64,
}

fn default_timeout_secs() -> u64 {
  DEFAULT_TIMEOUT.as_secs()
}

fn default_retries() -> u32 {
  DEFAULT_RETRIES
}

fn default_retry_delay_ms() -> u64 {
  DEFAULT_RETRY_DELAY.as_millis() as u64
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub max_size_bytes: u64,
  pub default_ttl_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      max_size_bytes: DEFAULT_MAX_SIZE,
      default_ttl_secs: DEFAULT_TTL.as_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub queue_capacity: usize,
  /// Path probed to decide reachability, relative to `api.base_url`
  pub probe_path: String,
  pub probe_interval_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      queue_capacity: DEFAULT_QUEUE_CAPACITY,
      probe_path: "/health".to_string(),
      probe_interval_secs: DEFAULT_PROBE_INTERVAL.as_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSection {
  pub refresh_path: String,
  pub max_refresh_attempts: u32,
  pub refresh_backoff_ms: u64,
}

impl Default for AuthSection {
  fn default() -> Self {
    Self {
      refresh_path: "/auth/refresh".to_string(),
      max_refresh_attempts: DEFAULT_MAX_REFRESH_ATTEMPTS,
      refresh_backoff_ms: DEFAULT_REFRESH_BACKOFF.as_millis() as u64,
    }
  }
}

impl Config {
  /// Configuration pointing at `base_url` with every other value defaulted.
  pub fn with_base_url(base_url: impl Into<String>) -> Self {
    Self {
      api: ApiConfig {
        base_url: base_url.into(),
        timeout_secs: default_timeout_secs(),
        retries: default_retries(),
        retry_delay_ms: default_retry_delay_ms(),
      },
      cache: CacheConfig::default(),
      network: NetworkConfig::default(),
      auth: AuthSection::default(),
      data_dir: None,
    }
  }

  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./carelink.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/carelink/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    Self::load_with_base_url(explicit_path, None)
  }

  /// Like [`Config::load`], with `base_url` overriding the file's value.
  ///
  /// When no file is found, `base_url` alone is enough. A file that exists
  /// but fails to parse is always an error.
  pub fn load_with_base_url(explicit_path: Option<&Path>, base_url: Option<&str>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    Self::from_source(path.as_deref(), base_url)
  }

  fn from_source(path: Option<&Path>, base_url: Option<&str>) -> Result<Self> {
    match (path, base_url) {
      (Some(p), base_url) => {
        let mut config = Self::load_from_path(p)?;
        if let Some(base_url) = base_url {
          config.api.base_url = base_url.to_string();
        }
        Ok(config)
      }
      (None, Some(base_url)) => Ok(Self::with_base_url(base_url)),
      (None, None) => Err(eyre!(
        "No configuration file found. Create one at ~/.config/carelink/config.yaml\n\
                 or pass --base-url."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("carelink.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("carelink").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// Directory for the SQLite store and log files.
  pub fn data_dir(&self) -> Result<PathBuf> {
    match &self.data_dir {
      Some(dir) => Ok(dir.clone()),
      None => default_data_dir(),
    }
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.api.timeout_secs)
  }

  pub fn retry_delay(&self) -> Duration {
    Duration::from_millis(self.api.retry_delay_ms)
  }

  pub fn default_ttl(&self) -> Duration {
    Duration::from_secs(self.cache.default_ttl_secs)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.network.probe_interval_secs)
  }

  pub fn refresh_backoff(&self) -> Duration {
    Duration::from_millis(self.auth.refresh_backoff_ms)
  }

  /// `base_url` joined with `path`, with exactly one slash between them.
  pub fn endpoint(&self, path: &str) -> String {
    format!(
      "{}/{}",
      self.api.base_url.trim_end_matches('/'),
      path.trim_start_matches('/')
    )
  }

  /// Tokens supplied through the environment, if an access token is set.
  pub fn env_tokens() -> Option<(String, Option<String>)> {
    let access = std::env::var(ACCESS_TOKEN_ENV).ok().filter(|s| !s.is_empty())?;
    let refresh = std::env::var(REFRESH_TOKEN_ENV).ok().filter(|s| !s.is_empty());
    Some((access, refresh))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("api:\n  base_url: https://api.carelink.test\n").unwrap();

    assert_eq!(config.api.retries, 3);
    assert_eq!(config.retry_delay(), Duration::from_millis(1000));
    assert_eq!(config.timeout(), Duration::from_secs(30));
    assert_eq!(config.cache.max_size_bytes, 50 * 1024 * 1024);
    assert_eq!(config.default_ttl(), Duration::from_secs(300));
    assert_eq!(config.network.queue_capacity, 100);
    assert_eq!(config.auth.max_refresh_attempts, 3);
    assert_eq!(
      config.endpoint(&config.auth.refresh_path),
      "https://api.carelink.test/auth/refresh"
    );
  }

  #[test]
  fn test_sections_override_defaults() {
    let yaml = r#"
api:
  base_url: https://api.carelink.test/v2/
  retries: 1
cache:
  default_ttl_secs: 60
network:
  probe_path: /status
data_dir: /tmp/carelink
"#;
    let config = Config::parse(yaml).unwrap();

    assert_eq!(config.api.retries, 1);
    assert_eq!(config.api.retry_delay_ms, 1000);
    assert_eq!(config.default_ttl(), Duration::from_secs(60));
    assert_eq!(config.cache.max_size_bytes, 50 * 1024 * 1024);
    assert_eq!(config.endpoint(&config.network.probe_path), "https://api.carelink.test/v2/status");
    assert_eq!(config.data_dir().unwrap(), PathBuf::from("/tmp/carelink"));
  }

  #[test]
  fn test_missing_base_url_is_an_error() {
    assert!(Config::parse("cache:\n  default_ttl_secs: 5\n").is_err());
  }

  #[test]
  fn test_base_url_stands_in_for_missing_file() {
    let config = Config::from_source(None, Some("https://api.carelink.test")).unwrap();
    assert_eq!(config.api.base_url, "https://api.carelink.test");
    assert!(Config::from_source(None, None).is_err());
  }

  #[test]
  fn test_base_url_overrides_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("carelink.yaml");
    std::fs::write(&path, "api:\n  base_url: https://file.test\n  retries: 1\n").unwrap();

    let config = Config::load_with_base_url(Some(&path), Some("https://flag.test")).unwrap();

    assert_eq!(config.api.base_url, "https://flag.test");
    assert_eq!(config.api.retries, 1);
  }

  #[test]
  fn test_broken_file_is_not_masked_by_base_url() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("carelink.yaml");
    std::fs::write(&path, "api: [not, a, map\n").unwrap();

    let err = Config::load_with_base_url(Some(&path), Some("https://flag.test")).unwrap_err();

    assert!(err.to_string().contains("Failed to parse config file"));
  }

  #[test]
  fn test_explicit_missing_path_is_an_error() {
    let err = Config::load(Some(Path::new("/nonexistent/carelink.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
