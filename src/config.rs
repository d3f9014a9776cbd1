use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

pub const TOKEN_ENV: &str = "ZONESYNC_API_TOKEN";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  /// Records web service; only needed by commands that talk to the server
  pub remote: Option<RemoteConfig>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Service root, e.g. "https://api.apple-cloudkit.com"
  pub url: String,
  /// Container identifier, e.g. "iCloud.com.example.notes"
  pub container: String,
  #[serde(default = "default_environment")]
  pub environment: String,
  #[serde(default = "default_database")]
  pub database: String,
  /// Zone used for records created without one
  pub default_zone: Option<String>,
}

fn default_environment() -> String {
  "development".to_string()
}

fn default_database() -> String {
  "private".to_string()
}

impl RemoteConfig {
  /// Base URL that record endpoints (`records/lookup`, ...) are joined onto.
  pub fn database_url(&self) -> Result<Url, url::ParseError> {
    Url::parse(&format!(
      "{}/database/1/{}/{}/{}/",
      self.url.trim_end_matches('/'),
      self.container,
      self.environment,
      self.database
    ))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// SQLite file (default: $XDG_DATA_HOME/zonesync/cache.db)
  pub path: Option<PathBuf>,
  /// Results per remote query page
  pub page_size: usize,
  /// Concurrent remote calls allowed per synchronizer
  pub max_in_flight: usize,
  /// Seconds a cached record is served without refetching
  pub stale_after_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      page_size: 50,
      max_in_flight: 4,
      stale_after_secs: 300,
    }
  }
}

impl CacheConfig {
  pub fn path(&self) -> PathBuf {
    self
      .path
      .clone()
      .unwrap_or_else(|| data_dir().join("cache.db"))
  }

  /// Saturates at the largest representable duration.
  pub fn stale_after(&self) -> chrono::Duration {
    i64::try_from(self.stale_after_secs)
      .ok()
      .and_then(chrono::Duration::try_seconds)
      .unwrap_or(chrono::Duration::MAX)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Default filter when RUST_LOG is unset
  pub level: String,
  /// Directory for the daily log file (default: $XDG_DATA_HOME/zonesync/logs)
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

impl LogConfig {
  pub fn directory(&self) -> PathBuf {
    self
      .directory
      .clone()
      .unwrap_or_else(|| data_dir().join("logs"))
  }
}

fn data_dir() -> PathBuf {
  dirs::data_dir()
    .unwrap_or_else(|| PathBuf::from("."))
    .join("zonesync")
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./zonesync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/zonesync/config.yaml
  ///
  /// Without any file the defaults are used, which is enough for local
  /// cache maintenance.
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
    let local = PathBuf::from("zonesync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("zonesync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn remote(&self) -> Result<&RemoteConfig> {
    self
      .remote
      .as_ref()
      .ok_or_else(|| eyre!("No `remote` section in the configuration file."))
  }

  /// Get the records service API token from the environment.
  pub fn get_api_token() -> Result<String> {
    std::env::var(TOKEN_ENV)
      .map_err(|_| eyre!("API token not found. Set the {} environment variable.", TOKEN_ENV))
  }
}
