use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::keys;
use crate::cache::{CacheOptions, KeyPolicy, ResourceKey, RetryPolicy};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080/api";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub api: ApiConfig,
  pub cache: CacheConfig,
  pub retry: RetryConfig,
  pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  pub base_url: String,
  /// Per-request ceiling in seconds
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: DEFAULT_BASE_URL.to_string(),
      timeout_secs: 10,
    }
  }
}

impl ApiConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Stale time for keys without an override
  pub stale_time_secs: u64,
  /// How long an unobserved entry is kept
  pub gc_time_secs: u64,
  /// Stale time per key prefix, e.g. `transactions/user: 120`
  pub stale_overrides: BTreeMap<String, u64>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time_secs: 0,
      gc_time_secs: 5 * 60,
      stale_overrides: BTreeMap::new(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  /// Total attempts per fetch, including the first
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    let policy = RetryPolicy::default();
    Self {
      max_attempts: policy.max_attempts,
      base_delay_ms: policy.base_delay.as_millis() as u64,
      max_delay_ms: policy.max_delay.as_millis() as u64,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
  /// Session database location (defaults to the user data directory)
  pub path: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file, falling back to defaults.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./bookdesk.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/bookdesk/config.yaml
  ///
  /// `BOOKDESK_API_URL` overrides the base URL from any source.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    if let Ok(url) = std::env::var("BOOKDESK_API_URL") {
      config.api.base_url = url;
    }
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("bookdesk.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("bookdesk").join("config.yaml");
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

  fn parse(contents: &str) -> Result<Self> {
    // An empty file is valid and means "all defaults".
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(contents)?)
  }

  fn validate(&self) -> Result<()> {
    url::Url::parse(&self.api.base_url)
      .map_err(|e| eyre!("Invalid api.base_url {}: {}", self.api.base_url, e))?;
    if self.api.timeout_secs == 0 {
      return Err(eyre!("api.timeout_secs must be positive"));
    }
    Ok(())
  }

  /// Token from `BOOKDESK_TOKEN`, used instead of the stored session.
  pub fn env_token() -> Option<String> {
    std::env::var("BOOKDESK_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_attempts: self.retry.max_attempts.max(1),
      base_delay: Duration::from_millis(self.retry.base_delay_ms),
      max_delay: Duration::from_millis(self.retry.max_delay_ms),
    }
  }

  /// Cache options: built-in per-resource settings, then the configured
  /// default stale time and per-prefix overrides on top.
  pub fn cache_options(&self) -> CacheOptions {
    let builtin = keys::default_stale_times();
    let mut stale_time = keys::default_stale_times();
    if self.cache.stale_time_secs > 0 {
      stale_time = KeyPolicy::new(Duration::from_secs(self.cache.stale_time_secs));
      for key in [keys::transactions(), keys::user_transactions(), keys::current_user()] {
        stale_time.set(key.clone(), *builtin.lookup(&key));
      }
    }
    for (prefix, secs) in &self.cache.stale_overrides {
      stale_time.set(ResourceKey::parse(prefix), Duration::from_secs(*secs));
    }

    CacheOptions {
      stale_time,
      retry: keys::default_retry_policies(self.retry_policy()),
      gc_time: Duration::from_secs(self.cache.gc_time_secs),
    }
  }
}
