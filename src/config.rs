use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::{StoreKind, StorePolicy};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the worker is registered for; same-origin checks compare against it
  pub origin: Url,
  /// Version suffix of every store name; bumping it invalidates all stores
  pub cache_version: String,
  pub offline_url: String,
  pub precache: Vec<String>,
  pub routes: RoutesConfig,
  pub stores: StoresConfig,
  /// How long an API request may wait on the network before falling back to cache
  pub api_timeout_ms: u64,
  pub queue: QueueConfig,
  pub sync: SyncConfig,
  pub notifications: NotificationConfig,
  /// Database path (default: $XDG_DATA_HOME/offline-sw/worker.db)
  pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
  /// Path prefixes that bypass the worker entirely
  pub excluded_path_prefixes: Vec<String>,
  /// Hosts that bypass the worker entirely (analytics and the like)
  pub excluded_hosts: Vec<String>,
  pub api_prefix: String,
  pub font_hosts: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorePolicyConfig {
  pub max_entries: Option<usize>,
  pub max_age_secs: Option<i64>,
}

/// Per-store limits. A store section in the file only replaces the fields it
/// names; `null` turns a limit off.
#[derive(Debug, Clone)]
pub struct StoresConfig {
  pub static_assets: StorePolicyConfig,
  pub runtime: StorePolicyConfig,
  pub font: StorePolicyConfig,
  pub image: StorePolicyConfig,
  pub api: StorePolicyConfig,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
struct PolicyOverride {
  #[serde(default, deserialize_with = "present")]
  max_entries: Option<Option<usize>>,
  #[serde(default, deserialize_with = "present")]
  max_age_secs: Option<Option<i64>>,
}

impl PolicyOverride {
  fn over(self, base: StorePolicyConfig) -> StorePolicyConfig {
    StorePolicyConfig {
      max_entries: self.max_entries.unwrap_or(base.max_entries),
      max_age_secs: self.max_age_secs.unwrap_or(base.max_age_secs),
    }
  }
}

/// Distinguishes an explicit `null` from a missing field.
fn present<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
  D: Deserializer<'de>,
  T: Deserialize<'de>,
{
  Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StoresOverride {
  static_assets: PolicyOverride,
  runtime: PolicyOverride,
  font: PolicyOverride,
  image: PolicyOverride,
  api: PolicyOverride,
}

impl<'de> Deserialize<'de> for StoresConfig {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
    let overrides = StoresOverride::deserialize(deserializer)?;
    let base = StoresConfig::default();
    Ok(StoresConfig {
      static_assets: overrides.static_assets.over(base.static_assets),
      runtime: overrides.runtime.over(base.runtime),
      font: overrides.font.over(base.font),
      image: overrides.image.over(base.image),
      api: overrides.api.over(base.api),
    })
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Queued requests older than this are dropped on the next replay
  pub retention_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub queue_tag: String,
  pub periodic_tag: String,
  /// Endpoints refreshed into the api store on every periodic sync
  pub periodic_urls: Vec<String>,
  /// Tick interval of `watch`
  pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: Url::parse("http://localhost:5000").expect("static url"),
      cache_version: "v3".to_string(),
      offline_url: "/offline".to_string(),
      precache: [
        "/",
        "/offline",
        "/static/css/style.css",
        "/static/css/theme.css",
        "/static/js/ave-effects.js",
        "/static/js/filter-list.js",
        "/static/js/random_video.js",
        "/static/js/sw-register.js",
        "/static/manifest.json",
        "/static/icons/favicon.ico",
        "/static/icons/android-chrome-192x192.png",
        "/static/icons/icon-512x512.png",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
      routes: RoutesConfig::default(),
      stores: StoresConfig::default(),
      api_timeout_ms: 3000,
      queue: QueueConfig::default(),
      sync: SyncConfig::default(),
      notifications: NotificationConfig::default(),
      database: None,
    }
  }
}

impl Default for RoutesConfig {
  fn default() -> Self {
    Self {
      excluded_path_prefixes: vec!["/admin".to_string()],
      excluded_hosts: vec![
        "www.google-analytics.com".to_string(),
        "www.googletagmanager.com".to_string(),
      ],
      api_prefix: "/api/".to_string(),
      font_hosts: vec![
        "fonts.googleapis.com".to_string(),
        "fonts.gstatic.com".to_string(),
      ],
    }
  }
}

impl Default for StoresConfig {
  fn default() -> Self {
    Self {
      static_assets: StorePolicyConfig::default(),
      runtime: StorePolicyConfig {
        max_entries: Some(50),
        max_age_secs: Some(24 * 60 * 60),
      },
      font: StorePolicyConfig {
        max_entries: Some(10),
        max_age_secs: None,
      },
      image: StorePolicyConfig {
        max_entries: Some(30),
        max_age_secs: Some(7 * 24 * 60 * 60),
      },
      api: StorePolicyConfig {
        max_entries: Some(20),
        max_age_secs: Some(5 * 60),
      },
    }
  }
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      retention_hours: 24,
    }
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      queue_tag: "sync-queue".to_string(),
      periodic_tag: "periodic-update".to_string(),
      periodic_urls: vec!["/api/latest-data".to_string(), "/api/stats".to_string()],
      interval_secs: 15 * 60,
    }
  }
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      title: "Новое уведомление".to_string(),
      body: "Откройте приложение".to_string(),
      icon: "/static/icons/android-chrome-192x192.png".to_string(),
      badge: "/static/icons/icon-192x192.png".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-sw.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-sw/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
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
    let local = PathBuf::from("offline-sw.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-sw").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// Versioned store name, e.g. `api-cache-v3`.
  pub fn store_name(&self, kind: StoreKind) -> String {
    format!("{}-cache-{}", kind.prefix(), self.cache_version)
  }

  /// Names of every store belonging to the current version.
  pub fn current_store_names(&self) -> Vec<String> {
    StoreKind::ALL
      .iter()
      .map(|kind| self.store_name(*kind))
      .collect()
  }

  pub fn policy(&self, kind: StoreKind) -> StorePolicy {
    let raw = match kind {
      StoreKind::Static => self.stores.static_assets,
      StoreKind::Runtime => self.stores.runtime,
      StoreKind::Font => self.stores.font,
      StoreKind::Image => self.stores.image,
      StoreKind::Api => self.stores.api,
    };
    StorePolicy {
      max_entries: raw.max_entries,
      max_age: raw.max_age_secs.map(Duration::seconds),
    }
  }

  pub fn api_timeout(&self) -> std::time::Duration {
    std::time::Duration::from_millis(self.api_timeout_ms)
  }

  pub fn queue_retention(&self) -> Duration {
    Duration::hours(self.queue.retention_hours)
  }

  /// Resolve a path such as `/offline` against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid url '{}': {}", path, e))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }
    Ok(data_dir()?.join("worker.db"))
  }
}

/// Directory holding the database and log files.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("offline-sw"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_match_current_generation() {
    let config = Config::default();
    assert_eq!(config.store_name(StoreKind::Api), "api-cache-v3");
    assert_eq!(config.current_store_names().len(), 5);
    assert_eq!(config.api_timeout(), std::time::Duration::from_secs(3));
    assert_eq!(config.queue_retention(), Duration::hours(24));
    assert!(config.precache.contains(&config.offline_url));
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      r#"
origin: "https://blacklist.example.org"
cache_version: v4
stores:
  api:
    max_entries: 5
    max_age_secs: 60
"#,
    )
    .unwrap();

    assert_eq!(config.origin.host_str(), Some("blacklist.example.org"));
    assert_eq!(config.store_name(StoreKind::Font), "font-cache-v4");
    let api = config.policy(StoreKind::Api);
    assert_eq!(api.max_entries, Some(5));
    assert_eq!(api.max_age, Some(Duration::seconds(60)));
    // Untouched sections fall back to defaults
    assert_eq!(config.policy(StoreKind::Runtime).max_entries, Some(50));
    assert_eq!(config.routes.api_prefix, "/api/");
    assert_eq!(config.sync.queue_tag, "sync-queue");
  }

  #[test]
  fn test_store_override_keeps_unnamed_limits() {
    let config = Config::from_yaml(
      r#"
stores:
  api:
    max_entries: 5
  image:
    max_age_secs: null
"#,
    )
    .unwrap();

    let api = config.policy(StoreKind::Api);
    assert_eq!(api.max_entries, Some(5));
    assert_eq!(api.max_age, Some(Duration::minutes(5)));
    assert!(api.expires());

    let image = config.policy(StoreKind::Image);
    assert_eq!(image.max_entries, Some(30));
    assert_eq!(image.max_age, None);
  }

  #[test]
  fn test_static_store_is_unbounded() {
    let policy = Config::default().policy(StoreKind::Static);
    assert_eq!(policy.max_entries, None);
    assert_eq!(policy.max_age, None);
  }

  #[test]
  fn test_resolve_against_origin() {
    let config = Config::default();
    let url = config.resolve("/api/stats").unwrap();
    assert_eq!(url.as_str(), "http://localhost:5000/api/stats");
  }
}
