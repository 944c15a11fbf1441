//! Versioned cache stores for offline support.
//!
//! This module provides the named partitions the worker caches into:
//! - One store per request class (static, runtime, font, image, api)
//! - Store names carry the cache version, so a version bump orphans old stores
//! - Per-store entry limits with FIFO eviction and optional max age
//! - SQLite persistence shared with the request queue

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{
  CachedResponse, ResponseSource, Served, StoreKind, StorePolicy, STALE_HEADER, TIMESTAMP_HEADER,
};
