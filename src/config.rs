use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{CacheConfig, DEFAULT_KEEP_UNUSED_FOR, DEFAULT_STALE_TIME};

pub const DEFAULT_BASE_URL: &str = "https://www.omdbapi.com/";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheSettings,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  #[serde(default = "default_base_url")]
  pub base_url: String,
  /// Query parameter that carries the API key
  #[serde(default = "default_api_key_param")]
  pub api_key_param: String,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: default_base_url(),
      api_key_param: default_api_key_param(),
    }
  }
}

fn default_base_url() -> String {
  DEFAULT_BASE_URL.to_string()
}

fn default_api_key_param() -> String {
  "apikey".to_string()
}

/// Cache timings, in seconds
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct CacheSettings {
  #[serde(default = "default_keep_unused_for")]
  pub keep_unused_for_secs: u64,
  #[serde(default = "default_stale_time")]
  pub stale_time_secs: u64,
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      keep_unused_for_secs: default_keep_unused_for(),
      stale_time_secs: default_stale_time(),
    }
  }
}

fn default_keep_unused_for() -> u64 {
  DEFAULT_KEEP_UNUSED_FOR.as_secs()
}

fn default_stale_time() -> u64 {
  DEFAULT_STALE_TIME.as_secs()
}

impl From<CacheSettings> for CacheConfig {
  fn from(settings: CacheSettings) -> Self {
    CacheConfig::default()
      .with_keep_unused_for(Duration::from_secs(settings.keep_unused_for_secs))
      .with_stale_time(Duration::from_secs(settings.stale_time_secs))
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
  /// Default filter directive, overridden by RUST_LOG
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Write daily rolling log files here instead of stderr
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      directory: None,
    }
  }
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./querycache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/querycache/config.yaml
  ///
  /// Without a config file the defaults are used.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("querycache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("querycache").join("config.yaml");
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

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    // An empty file is a valid, all-default config
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  /// Get the OMDb API key from environment variables.
  ///
  /// Checks QUERYCACHE_API_KEY first, then OMDB_API_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("QUERYCACHE_API_KEY")
      .or_else(|_| std::env::var("OMDB_API_KEY"))
      .map_err(|_| {
        eyre!("OMDb API key not found. Set QUERYCACHE_API_KEY or OMDB_API_KEY environment variable.")
      })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_config_uses_defaults() {
    let config = Config::parse("").unwrap();
    assert_eq!(config.api.base_url, DEFAULT_BASE_URL);
    assert_eq!(config.api.api_key_param, "apikey");
    assert_eq!(config.cache, CacheSettings::default());
    assert_eq!(config.logging.level, "info");
    assert!(config.logging.directory.is_none());
  }

  #[test]
  fn test_partial_sections_fill_defaults() {
    let config = Config::parse(
      r#"
api:
  base_url: http://localhost:8080/
cache:
  stale_time_secs: 10
logging:
  directory: /tmp/querycache
"#,
    )
    .unwrap();

    assert_eq!(config.api.base_url, "http://localhost:8080/");
    assert_eq!(config.api.api_key_param, "apikey");

    let cache = CacheConfig::from(config.cache);
    assert_eq!(cache.stale_time, Duration::from_secs(10));
    assert_eq!(cache.keep_unused_for, DEFAULT_KEEP_UNUSED_FOR);
    assert_eq!(
      config.logging.directory.as_deref(),
      Some(Path::new("/tmp/querycache"))
    );
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let err = Config::load(Some(Path::new("/nonexistent/querycache.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
