//! Policy-aware access to the cache stores of one worker generation.

use chrono::Utc;
use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, info};

use super::storage::CacheStorage;
use super::traits::{CachedResponse, StoreKind, TIMESTAMP_HEADER};
use crate::config::Config;
use crate::net::{Request, Response};

/// Cache layer that applies store naming, timestamps and limits.
///
/// Every write is followed by a trim of the written store, so a store never
/// stays above its configured size.
pub struct CacheLayer {
  storage: Arc<dyn CacheStorage>,
  config: Arc<Config>,
}

impl CacheLayer {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: Arc<dyn CacheStorage>, config: Arc<Config>) -> Self {
    Self { storage, config }
  }

  pub fn name(&self, kind: StoreKind) -> String {
    self.config.store_name(kind)
  }

  /// Create the store if it does not exist yet. Returns its name.
  pub fn open(&self, kind: StoreKind) -> Result<String> {
    let name = self.name(kind);
    self.storage.open(&name)?;
    Ok(name)
  }

  /// Store a response, stamping it when the store expires entries, then trim.
  pub fn put(&self, kind: StoreKind, request: &Request, response: &Response) -> Result<()> {
    let name = self.name(kind);
    let policy = self.config.policy(kind);
    let now = Utc::now();

    if policy.expires() {
      let stamped = response
        .clone()
        .with_header(TIMESTAMP_HEADER, &now.timestamp_millis().to_string());
      self.storage.put(&name, request, &stamped, Some(now))?;
    } else {
      self.storage.put(&name, request, response, None)?;
    }

    debug!(store = %name, url = %request.url, "Cached response");
    self.trim(kind)?;
    Ok(())
  }

  /// Store a batch in one transaction. Used for precaching.
  pub fn put_all(&self, kind: StoreKind, entries: &[(Request, Response)]) -> Result<()> {
    let name = self.name(kind);
    let stored_at = self.config.policy(kind).max_age.map(|_| Utc::now());
    self.storage.put_all(&name, entries, stored_at)?;
    self.trim(kind)?;
    Ok(())
  }

  /// Drop one entry. Returns whether it was cached.
  pub fn delete(&self, kind: StoreKind, request: &Request) -> Result<bool> {
    let name = self.name(kind);
    let deleted = self.storage.delete(&name, &request.cache_key())?;
    if deleted {
      debug!(store = %name, url = %request.url, "Evicted entry");
    }
    Ok(deleted)
  }

  pub fn lookup(&self, kind: StoreKind, request: &Request) -> Result<Option<CachedResponse>> {
    self.storage.get(&self.name(kind), &request.cache_key())
  }

  /// Look a request up in every store of the current generation.
  pub fn match_any(&self, request: &Request) -> Result<Option<CachedResponse>> {
    for kind in StoreKind::ALL {
      if let Some(cached) = self.lookup(kind, request)? {
        return Ok(Some(cached));
      }
    }
    Ok(None)
  }

  /// Whether a cached entry is inside its store's max age. Entries of stores
  /// without a max age are always fresh.
  pub fn is_fresh(&self, kind: StoreKind, cached: &CachedResponse) -> bool {
    match self.config.policy(kind).max_age {
      Some(max_age) => cached.is_fresh(max_age, Utc::now()),
      None => true,
    }
  }

  /// Apply the store's age and size limits.
  pub fn trim(&self, kind: StoreKind) -> Result<usize> {
    let name = self.name(kind);
    let removed = self
      .storage
      .trim(&name, &self.config.policy(kind), Utc::now())?;
    if removed > 0 {
      debug!(store = %name, removed, "Trimmed store");
    }
    Ok(removed)
  }

  pub fn keys(&self, kind: StoreKind) -> Result<Vec<String>> {
    self.storage.keys(&self.name(kind))
  }

  pub fn store_names(&self) -> Result<Vec<String>> {
    self.storage.store_names()
  }

  /// Delete every store whose name is not in the current generation.
  pub fn purge_obsolete(&self) -> Result<Vec<String>> {
    let current = self.config.current_store_names();
    let mut purged = Vec::new();

    for name in self.storage.store_names()? {
      if !current.contains(&name) {
        self.storage.delete_store(&name)?;
        info!(store = %name, "Deleted obsolete store");
        purged.push(name);
      }
    }

    Ok(purged)
  }

  /// Delete every store, current generation included.
  pub fn clear(&self) -> Result<usize> {
    let names = self.storage.store_names()?;
    for name in &names {
      self.storage.delete_store(name)?;
    }
    info!(count = names.len(), "Cleared all stores");
    Ok(names.len())
  }
}

impl Clone for CacheLayer {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      config: Arc::clone(&self.config),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::db::Database;

  fn layer(config: Config) -> CacheLayer {
    let db = Arc::new(Database::open_in_memory().unwrap());
    CacheLayer::new(Arc::new(SqliteStorage::new(db)), Arc::new(config))
  }

  fn request(config: &Config, path: &str) -> Request {
    Request::get(config.resolve(path).unwrap())
  }

  #[test]
  fn test_put_stamps_only_expiring_stores() {
    let config = Config::default();
    let cache = layer(config.clone());
    let req = request(&config, "/api/stats");

    cache.put(StoreKind::Api, &req, &Response::new(200, "{}")).unwrap();
    let cached = cache.lookup(StoreKind::Api, &req).unwrap().unwrap();
    assert!(cached.stored_at.is_some());
    assert!(cached.response.header(TIMESTAMP_HEADER).is_some());
    assert!(cache.is_fresh(StoreKind::Api, &cached));

    let font = Request::get(url::Url::parse("https://fonts.gstatic.com/s/poppins.woff2").unwrap());
    cache.put(StoreKind::Font, &font, &Response::new(200, "font")).unwrap();
    let cached = cache.lookup(StoreKind::Font, &font).unwrap().unwrap();
    assert!(cached.stored_at.is_none());
    assert!(cached.response.header(TIMESTAMP_HEADER).is_none());
    assert!(cache.is_fresh(StoreKind::Font, &cached));
  }

  #[test]
  fn test_put_keeps_newest_entries_within_limit() {
    let mut config = Config::default();
    config.stores.image.max_entries = Some(3);
    let cache = layer(config.clone());

    for i in 0..4 {
      let req = request(&config, &format!("/static/img/{}.png", i));
      cache.put(StoreKind::Image, &req, &Response::new(200, "png")).unwrap();
    }

    let keys = cache.keys(StoreKind::Image).unwrap();
    assert_eq!(keys.len(), 3);
    assert!(keys[0].ends_with("/1.png"));
    assert!(keys[2].ends_with("/3.png"));
  }

  #[test]
  fn test_match_any_finds_precached_page() {
    let config = Config::default();
    let cache = layer(config.clone());
    let offline = request(&config, "/offline");
    cache
      .put_all(StoreKind::Static, &[(offline.clone(), Response::new(200, "offline"))])
      .unwrap();

    let found = cache.match_any(&offline).unwrap().unwrap();
    assert_eq!(found.store, "static-cache-v3");
    assert_eq!(found.response.text(), "offline");
  }

  #[test]
  fn test_purge_obsolete_keeps_current_generation() {
    let config = Config::default();
    let db = Arc::new(Database::open_in_memory().unwrap());
    let storage: Arc<dyn CacheStorage> = Arc::new(SqliteStorage::new(db));
    let v2 = CacheLayer::new(
      storage.clone(),
      Arc::new(Config {
        cache_version: "v2".to_string(),
        ..config.clone()
      }),
    );
    let v3 = CacheLayer::new(storage, Arc::new(config));

    v2.open(StoreKind::Static).unwrap();
    v2.open(StoreKind::Api).unwrap();
    v3.open(StoreKind::Static).unwrap();

    let purged = v3.purge_obsolete().unwrap();
    assert_eq!(purged, vec!["static-cache-v2", "api-cache-v2"]);
    assert_eq!(v3.store_names().unwrap(), vec!["static-cache-v3"]);

    // Nothing left to purge the second time
    assert!(v3.purge_obsolete().unwrap().is_empty());
  }

  #[test]
  fn test_delete_evicts_single_entry() {
    let config = Config::default();
    let cache = layer(config.clone());
    let a = request(&config, "/a");
    let b = request(&config, "/b");
    cache.put(StoreKind::Runtime, &a, &Response::new(200, "a")).unwrap();
    cache.put(StoreKind::Runtime, &b, &Response::new(200, "b")).unwrap();

    assert!(cache.delete(StoreKind::Runtime, &a).unwrap());
    assert!(!cache.delete(StoreKind::Runtime, &a).unwrap());
    assert!(cache.lookup(StoreKind::Runtime, &a).unwrap().is_none());
    assert!(cache.lookup(StoreKind::Runtime, &b).unwrap().is_some());
  }

  #[test]
  fn test_clear_removes_everything() {
    let config = Config::default();
    let cache = layer(config.clone());
    cache.open(StoreKind::Static).unwrap();
    cache
      .put(StoreKind::Runtime, &request(&config, "/a"), &Response::new(200, "a"))
      .unwrap();

    assert_eq!(cache.clear().unwrap(), 2);
    assert!(cache.store_names().unwrap().is_empty());
  }
}
