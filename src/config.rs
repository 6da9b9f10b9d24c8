use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Base URL of the origin server that requests are forwarded to
  pub origin: String,
  /// Address the interception listener binds to
  pub listen: String,
  /// Base URL of the foreground app, used when opening windows for notifications
  pub app_url: Option<String>,
  /// Schema version tag; partitions from other versions are collected on activation
  pub version: String,
  /// Activate a freshly installed version without waiting for a skip-waiting message
  pub skip_waiting: bool,
  pub fetch_timeout_secs: u64,
  /// Interval for origin connectivity probes (0 disables the monitor)
  pub probe_interval_secs: u64,
  pub storage: StorageConfig,
  /// Resources fetched into the cache at install time
  pub precache: Vec<String>,
  /// Document served to navigations when nothing else is available
  pub offline_page: Option<String>,
  pub ttl: TtlConfig,
  pub classifier: ClassifierConfig,
  pub notifications: NotificationConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://127.0.0.1:3000".to_string(),
      listen: "127.0.0.1:8787".to_string(),
      app_url: None,
      version: "v1".to_string(),
      skip_waiting: false,
      fetch_timeout_secs: 12,
      probe_interval_secs: 30,
      storage: StorageConfig::default(),
      precache: vec!["/".to_string(), "/manifest.json".to_string()],
      offline_page: Some("/offline.html".to_string()),
      ttl: TtlConfig::default(),
      classifier: ClassifierConfig::default(),
      notifications: NotificationConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
  /// Durable SQLite database
  #[default]
  Sqlite,
  /// Process-local store, lost on exit
  Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  pub backend: StorageBackend,
  /// Database file (default: $XDG_DATA_HOME/tarmac/cache.db)
  pub path: Option<PathBuf>,
}

/// Per-category maximum ages, in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
  pub static_asset_secs: u64,
  pub image_secs: u64,
  pub cacheable_api_secs: u64,
  pub fallback_secs: u64,
}

impl Default for TtlConfig {
  fn default() -> Self {
    Self {
      static_asset_secs: 7 * 24 * 60 * 60,
      image_secs: 24 * 60 * 60,
      cacheable_api_secs: 30 * 60,
      fallback_secs: 60 * 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
  /// File extensions (without dot) served cache-first
  pub static_extensions: Vec<String>,
  pub static_prefixes: Vec<String>,
  pub static_paths: Vec<String>,
  /// Critical endpoints that must hit the network first
  pub network_first_prefixes: Vec<String>,
  /// Regexes matched against the full URL and the path
  pub cacheable_api_patterns: Vec<String>,
  pub image_extensions: Vec<String>,
}

impl Default for ClassifierConfig {
  fn default() -> Self {
    fn strings(items: &[&str]) -> Vec<String> {
      items.iter().map(|s| s.to_string()).collect()
    }

    Self {
      static_extensions: strings(&[
        "js",
        "css",
        "woff",
        "woff2",
        "ttf",
        "eot",
        "ico",
        "webmanifest",
        "map",
      ]),
      static_prefixes: strings(&["/static/", "/assets/", "/icons/"]),
      static_paths: strings(&["/manifest.json"]),
      network_first_prefixes: strings(&[
        "/api/runs",
        "/api/notifications",
        "/api/preferences",
        "/api/auth",
      ]),
      cacheable_api_patterns: strings(&[
        r"^/api/flights",
        r"^/api/airports",
        r"^/api/weather",
        r"^https://api\.weather\.gov/",
        r"^https://maps\.googleapis\.com/",
      ]),
      image_extensions: strings(&["png", "jpg", "jpeg", "gif", "webp", "svg", "avif"]),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub icon: String,
  pub badge: String,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      icon: "/icons/icon-192x192.png".to_string(),
      badge: "/icons/badge-72x72.png".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tarmac.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tarmac/config.yaml
  ///
  /// Falls back to built-in defaults when no file exists. Environment
  /// overrides are applied last.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    Ok(config.with_env_overrides())
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("tarmac.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tarmac").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Apply TARMAC_ORIGIN and TARMAC_LISTEN when set.
  fn with_env_overrides(mut self) -> Self {
    if let Ok(origin) = std::env::var("TARMAC_ORIGIN") {
      self.origin = origin;
    }
    if let Ok(listen) = std::env::var("TARMAC_LISTEN") {
      self.listen = listen;
    }
    self
  }

  pub fn fetch_timeout(&self) -> Duration {
    Duration::from_secs(self.fetch_timeout_secs.max(1))
  }

  pub fn probe_interval(&self) -> Option<Duration> {
    (self.probe_interval_secs > 0).then(|| Duration::from_secs(self.probe_interval_secs))
  }

  /// Get the database path, defaulting to the user data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.storage.path {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("tarmac").join("cache.db"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_apply_to_missing_sections() {
    let config = Config::from_yaml("origin: http://origin.test\nversion: v7\n").unwrap();
    assert_eq!(config.origin, "http://origin.test");
    assert_eq!(config.version, "v7");
    assert_eq!(config.ttl.cacheable_api_secs, 1800);
    assert_eq!(config.ttl.static_asset_secs, 604_800);
    assert_eq!(config.storage.backend, StorageBackend::Sqlite);
    assert!(config
      .classifier
      .network_first_prefixes
      .contains(&"/api/runs".to_string()));
  }

  #[test]
  fn test_storage_backend_parses_lowercase() {
    let config = Config::from_yaml("storage:\n  backend: memory\n").unwrap();
    assert_eq!(config.storage.backend, StorageBackend::Memory);
  }

  #[test]
  fn test_probe_interval_zero_disables_monitor() {
    let config = Config {
      probe_interval_secs: 0,
      ..Config::default()
    };
    assert!(config.probe_interval().is_none());
    assert_eq!(
      Config::default().probe_interval(),
      Some(Duration::from_secs(30))
    );
  }

  #[test]
  fn test_missing_explicit_path_is_error() {
    let err = Config::load(Some(Path::new("/nonexistent/tarmac.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
