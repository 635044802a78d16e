use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::remote::DEFAULT_HEALTH_TABLE;
use crate::store::DEFAULT_CAPACITY_BYTES;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
  /// Base URL of the PostgREST-compatible service (e.g. https://xyz.supabase.co)
  pub url: String,
  /// Table read by the health check
  pub health_table: String,
  /// Per-request timeout
  pub timeout_secs: u64,
  /// How often realtime channels poll for changed rows
  pub realtime_poll_secs: u64,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      url: String::new(),
      health_table: DEFAULT_HEALTH_TABLE.to_string(),
      timeout_secs: 30,
      realtime_poll_secs: 5,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// TTL applied to catalog queries issued by the CLI and remote refreshes
  pub ttl_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self { ttl_secs: 300 }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Path of the local store database (defaults to the platform data dir)
  pub path: Option<PathBuf>,
  /// Capacity assumed when reporting storage usage
  pub capacity_bytes: u64,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      path: None,
      capacity_bytes: DEFAULT_CAPACITY_BYTES,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./catalog-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/catalog-sync/config.yaml
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
        "No configuration file found. Create one at ~/.config/catalog-sync/config.yaml\n\
                 with at least `remote: {{ url: ... }}`."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("catalog-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("catalog-sync").join("config.yaml");
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

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.remote.url.trim().is_empty() {
      return Err(eyre!("`remote.url` must be set"));
    }
    Ok(config)
  }

  /// Get the remote API key from environment variables.
  ///
  /// Checks CATALOG_SYNC_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("CATALOG_SYNC_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        eyre!(
          "API key not found. Set CATALOG_SYNC_API_KEY or SUPABASE_ANON_KEY environment variable."
        )
      })
  }
}
