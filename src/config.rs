use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::youtrack::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub youtrack: YouTrackConfig,
  /// Issue query used when none is given on the command line
  #[serde(default = "default_query")]
  pub default_query: String,
  /// Project short name to scope issue searches to
  pub default_project: Option<String>,
  #[serde(default = "default_page_size")]
  pub page_size: u32,
  #[serde(default)]
  pub cache: CacheConfig,
}

fn default_query() -> String {
  "#Unresolved".to_string()
}

fn default_page_size() -> u32 {
  100
}

#[derive(Debug, Clone, Deserialize)]
pub struct YouTrackConfig {
  pub url: String,
  /// Retries after the first attempt
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
  /// Per-attempt deadline
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
  #[serde(default = "default_retry_base_ms")]
  pub retry_base_ms: u64,
  #[serde(default = "default_retry_cap_ms")]
  pub retry_cap_ms: u64,
}

fn default_max_retries() -> u32 {
  3
}

fn default_timeout_ms() -> u64 {
  30_000
}

fn default_retry_base_ms() -> u64 {
  1_000
}

fn default_retry_cap_ms() -> u64 {
  10_000
}

impl YouTrackConfig {
  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy::new(
      self.max_retries,
      Duration::from_millis(self.retry_base_ms),
      Duration::from_millis(self.retry_cap_ms),
    )
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// When false, nothing is read from or written to disk
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Override for the issues cache file
  pub path: Option<PathBuf>,
}

fn default_true() -> bool {
  true
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
    }
  }
}

impl CacheConfig {
  /// The issues cache file: the configured path, or
  /// `$XDG_DATA_HOME/ytui/issues-cache.json`.
  pub fn issues_path(&self) -> Result<PathBuf> {
    match &self.path {
      Some(p) => Ok(p.clone()),
      None => Ok(data_dir()?.join("issues-cache.json")),
    }
  }
}

/// Per-user data directory for the cache and log file.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("ytui"))
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./ytui.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/ytui/config.yaml
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
        "No configuration file found. Create one at ~/.config/ytui/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("ytui.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("ytui").join("config.yaml");
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

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.youtrack.url.trim().is_empty() {
      return Err(eyre!("youtrack.url must not be empty"));
    }
    Ok(config)
  }

  /// Get the YouTrack permanent token from environment variables.
  ///
  /// Checks YTUI_TOKEN first, then YOUTRACK_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("YTUI_TOKEN")
      .or_else(|_| std::env::var("YOUTRACK_TOKEN"))
      .map_err(|_| {
        eyre!("YouTrack token not found. Set YTUI_TOKEN or YOUTRACK_TOKEN environment variable.")
      })
  }
}
