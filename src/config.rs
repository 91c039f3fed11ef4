use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache::{Freshness, CACHE_DURATION_SECS, DEFAULT_KEY_PREFIX, STALE_WHILE_REVALIDATE_SECS};

/// Page size used by the batch fetcher unless configured otherwise.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub graphql: GraphqlConfig,
  #[serde(default)]
  pub batch: BatchConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphqlConfig {
  pub url: String,
  /// Request timeout for each GraphQL call
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
  #[serde(default = "default_page_size")]
  pub page_size: u32,
}

impl Default for BatchConfig {
  fn default() -> Self {
    Self {
      page_size: DEFAULT_PAGE_SIZE,
    }
  }
}

fn default_page_size() -> u32 {
  DEFAULT_PAGE_SIZE
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_true")]
  pub enabled: bool,
  #[serde(default = "default_stale_after")]
  pub stale_after_secs: i64,
  #[serde(default = "default_expire_after")]
  pub expire_after_secs: i64,
  #[serde(default = "default_key_prefix")]
  pub key_prefix: String,
  /// Override for the cache database location
  pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      stale_after_secs: STALE_WHILE_REVALIDATE_SECS,
      expire_after_secs: CACHE_DURATION_SECS,
      key_prefix: DEFAULT_KEY_PREFIX.to_string(),
      path: None,
    }
  }
}

fn default_true() -> bool {
  true
}

fn default_stale_after() -> i64 {
  STALE_WHILE_REVALIDATE_SECS
}

fn default_expire_after() -> i64 {
  CACHE_DURATION_SECS
}

fn default_key_prefix() -> String {
  DEFAULT_KEY_PREFIX.to_string()
}

impl CacheConfig {
  pub fn freshness(&self) -> Freshness {
    Freshness::new(
      Duration::seconds(self.stale_after_secs),
      Duration::seconds(self.expire_after_secs),
    )
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./spsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/spsync/config.yaml
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/spsync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("spsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("spsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  /// Parse and validate YAML configuration.
  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    let url = url::Url::parse(&self.graphql.url)
      .map_err(|e| eyre!("Invalid GraphQL url {:?}: {}", self.graphql.url, e))?;
    if !matches!(url.scheme(), "http" | "https") {
      return Err(eyre!("GraphQL url must be http or https: {}", url));
    }
    if self.batch.page_size == 0 {
      return Err(eyre!("batch.page_size must be at least 1"));
    }
    if self.cache.stale_after_secs < 0 || self.cache.expire_after_secs < self.cache.stale_after_secs
    {
      return Err(eyre!(
        "cache windows must satisfy 0 <= stale_after_secs <= expire_after_secs"
      ));
    }
    Ok(())
  }

  /// Get the API token from environment variables.
  ///
  /// Checks SPSYNC_TOKEN first, then SP_API_TOKEN as fallback. A missing
  /// token is not an error; some deployments authenticate by network.
  pub fn get_api_token() -> Option<String> {
    std::env::var("SPSYNC_TOKEN")
      .or_else(|_| std::env::var("SP_API_TOKEN"))
      .ok()
      .filter(|t| !t.is_empty())
  }
}
