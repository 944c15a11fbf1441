//! Core types for the cache stores.

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use crate::net::Response;

/// Response header carrying the write time (ms since epoch) of entries in
/// stores with a max age.
pub const TIMESTAMP_HEADER: &str = "sw-timestamp";

/// Response header added when a cached copy past its max age is served.
pub const STALE_HEADER: &str = "X-Cache-Warning";

/// The cache partitions of one worker generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
  /// Precached shell and offline page
  Static,
  /// Same-origin GETs served stale-while-revalidate
  Runtime,
  Font,
  Image,
  Api,
}

impl StoreKind {
  pub const ALL: [StoreKind; 5] = [
    StoreKind::Static,
    StoreKind::Runtime,
    StoreKind::Font,
    StoreKind::Image,
    StoreKind::Api,
  ];

  /// Name prefix, versioned by the config into e.g. `image-cache-v3`.
  pub fn prefix(&self) -> &'static str {
    match self {
      StoreKind::Static => "static",
      StoreKind::Runtime => "runtime",
      StoreKind::Font => "font",
      StoreKind::Image => "image",
      StoreKind::Api => "api",
    }
  }
}

/// Size and age limits of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorePolicy {
  /// Entry count limit; oldest insertions are evicted first
  pub max_entries: Option<usize>,
  /// Entries written longer ago than this are expired
  pub max_age: Option<Duration>,
}

impl StorePolicy {
  pub fn expires(&self) -> bool {
    self.max_age.is_some()
  }
}

/// A stored response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub store: String,
  pub url: String,
  pub response: Response,
  /// Write time, recorded only for stores with a max age
  pub stored_at: Option<DateTime<Utc>>,
}

impl CachedResponse {
  /// Whether the entry is still inside `max_age`. Entries without a
  /// timestamp are never fresh.
  pub fn is_fresh(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
    match self.stored_at {
      Some(stored_at) => now - stored_at <= max_age,
      None => false,
    }
  }
}

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Response the host started before the worker ran
  Preload,
  /// Live network response
  Network,
  /// Cached copy, fresh or from a store without expiry
  Cache,
  /// Cached copy past its max age, flagged with the stale header
  CacheStale,
  /// The precached offline page
  OfflineFallback,
  /// Acknowledgement for a request saved to the replay queue
  Queued,
  /// Error response made up by the worker
  Synthesized,
}

/// A response together with its provenance.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: ResponseSource,
}

impl Served {
  pub fn new(response: Response, source: ResponseSource) -> Self {
    Self { response, source }
  }

  pub fn network(response: Response) -> Self {
    Self::new(response, ResponseSource::Network)
  }

  pub fn cache(cached: CachedResponse) -> Self {
    Self::new(cached.response, ResponseSource::Cache)
  }

  pub fn synthesized(response: Response) -> Self {
    Self::new(response, ResponseSource::Synthesized)
  }
}

/// SHA256 of a request key, for stable fixed-length storage keys.
pub fn request_hash(cache_key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(cache_key.as_bytes());
  hex::encode(hasher.finalize())
}
