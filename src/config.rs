use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::sync::SyncOptions;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Project URL of the backend, e.g. https://abc.supabase.co
  pub url: String,
  /// Owner of every remote row this client reads or writes
  pub user_id: String,
  /// Per-request timeout; an expired request counts as unreachable
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  10
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
  /// Cache database location (defaults to the platform data directory)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Replay records written while offline before a forced resync
  #[serde(default = "default_replay_pending")]
  pub replay_pending: bool,
}

fn default_replay_pending() -> bool {
  true
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      replay_pending: default_replay_pending(),
    }
  }
}

impl From<&SyncConfig> for SyncOptions {
  fn from(config: &SyncConfig) -> Self {
    Self {
      replay_pending: config.replay_pending,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./chatsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/chatsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/chatsync/config.yaml\n\
         with at least remote.url and remote.user_id."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("chatsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("chatsync").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents)?;
    if config.remote.url.trim().is_empty() {
      return Err(eyre!("remote.url must not be empty"));
    }
    if config.remote.user_id.trim().is_empty() {
      return Err(eyre!("remote.user_id must not be empty"));
    }
    Ok(config)
  }

  /// Get the backend API key from environment variables.
  ///
  /// Checks CHATSYNC_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("CHATSYNC_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        eyre!("API key not found. Set CHATSYNC_API_KEY or SUPABASE_ANON_KEY environment variable.")
      })
  }
}
