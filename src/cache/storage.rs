//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Transaction};
use std::sync::Arc;

use super::traits::{request_hash, CachedResponse, StorePolicy};
use crate::db::Database;
use crate::net::{Request, Response};

/// Trait for cache storage backends.
///
/// Stores are addressed by their full versioned name. Within a store there is
/// at most one entry per request key, and enumeration order is insertion
/// order (an overwrite counts as a fresh insertion).
pub trait CacheStorage: Send + Sync {
  /// Create the store if absent.
  fn open(&self, store: &str) -> Result<()>;

  /// Write one entry, replacing any entry with the same request key.
  fn put(
    &self,
    store: &str,
    request: &Request,
    response: &Response,
    stored_at: Option<DateTime<Utc>>,
  ) -> Result<()>;

  /// Write several entries as one transaction: all land or none do.
  fn put_all(
    &self,
    store: &str,
    entries: &[(Request, Response)],
    stored_at: Option<DateTime<Utc>>,
  ) -> Result<()>;

  /// Look up an entry by request key (see [`Request::cache_key`]).
  fn get(&self, store: &str, cache_key: &str) -> Result<Option<CachedResponse>>;

  /// Remove one entry. Returns whether it existed.
  fn delete(&self, store: &str, cache_key: &str) -> Result<bool>;

  /// URLs of the store's entries in enumeration order.
  fn keys(&self, store: &str) -> Result<Vec<String>>;

  /// Drop expired entries, then evict oldest entries until the store fits.
  /// Returns the number of entries removed.
  fn trim(&self, store: &str, policy: &StorePolicy, now: DateTime<Utc>) -> Result<usize>;

  /// Names of every existing store, in creation order.
  fn store_names(&self) -> Result<Vec<String>>;

  /// Delete a store and all its entries. Returns whether it existed.
  fn delete_store(&self, store: &str) -> Result<bool>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

fn ensure_store(tx: &Transaction<'_>, store: &str) -> Result<()> {
  tx.execute(
    "INSERT OR IGNORE INTO cache_stores (name) VALUES (?)",
    params![store],
  )
  .map_err(|e| eyre!("Failed to create store {}: {}", store, e))?;
  Ok(())
}

fn insert_entry(
  tx: &Transaction<'_>,
  store: &str,
  request: &Request,
  response: &Response,
  stored_at: Option<DateTime<Utc>>,
) -> Result<()> {
  let key = request_hash(&request.cache_key());
  let url = request.url.as_str();
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;
  let stored_ms = stored_at.map(|t| t.timestamp_millis());

  // Delete first so an overwrite moves the entry to the end of the store
  tx.execute(
    "DELETE FROM cache_entries WHERE store = ? AND request_key = ?",
    params![store, key],
  )
  .map_err(|e| eyre!("Failed to replace cache entry: {}", e))?;

  tx.execute(
    "INSERT INTO cache_entries (store, request_key, url, status, status_text, headers, body, stored_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    params![
      store,
      key,
      url,
      response.status,
      response.status_text,
      headers,
      response.body,
      stored_ms
    ],
  )
  .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

  tx.execute(
    "INSERT OR REPLACE INTO cache_metadata (url, store, stored_at) VALUES (?, ?, ?)",
    params![
      url,
      store,
      stored_ms.unwrap_or_else(|| Utc::now().timestamp_millis())
    ],
  )
  .map_err(|e| eyre!("Failed to update cache metadata: {}", e))?;

  Ok(())
}

/// Drop metadata rows of `store` whose URL no longer has an entry there.
fn prune_metadata(tx: &Transaction<'_>, store: &str) -> Result<usize> {
  tx.execute(
    "DELETE FROM cache_metadata
     WHERE store = ?1 AND url NOT IN (SELECT url FROM cache_entries WHERE store = ?1)",
    params![store],
  )
  .map_err(|e| eyre!("Failed to prune cache metadata of {}: {}", store, e))
}

impl CacheStorage for SqliteStorage {
  fn open(&self, store: &str) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO cache_stores (name) VALUES (?)",
        params![store],
      )
      .map_err(|e| eyre!("Failed to create store {}: {}", store, e))?;
    Ok(())
  }

  fn put(
    &self,
    store: &str,
    request: &Request,
    response: &Response,
    stored_at: Option<DateTime<Utc>>,
  ) -> Result<()> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_store(&tx, store)?;
    insert_entry(&tx, store, request, response, stored_at)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))
  }

  fn put_all(
    &self,
    store: &str,
    entries: &[(Request, Response)],
    stored_at: Option<DateTime<Utc>>,
  ) -> Result<()> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_store(&tx, store)?;
    for (request, response) in entries {
      insert_entry(&tx, store, request, response, stored_at)?;
    }

    // Dropping the transaction on an early return rolls everything back
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))
  }

  fn get(&self, store: &str, cache_key: &str) -> Result<Option<CachedResponse>> {
    let conn = self.db.lock()?;
    let key = request_hash(cache_key);

    let row: Option<(String, u16, String, String, Vec<u8>, Option<i64>)> = conn
      .query_row(
        "SELECT url, status, status_text, headers, body, stored_at FROM cache_entries
         WHERE store = ? AND request_key = ?",
        params![store, key],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache entry: {}", e))?;

    match row {
      Some((url, status, status_text, headers, body, stored_ms)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", url, e))?;
        Ok(Some(CachedResponse {
          store: store.to_string(),
          url,
          response: Response {
            status,
            status_text,
            headers,
            body,
          },
          stored_at: stored_ms.and_then(from_millis),
        }))
      }
      None => Ok(None),
    }
  }

  fn delete(&self, store: &str, cache_key: &str) -> Result<bool> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let removed = tx
      .execute(
        "DELETE FROM cache_entries WHERE store = ? AND request_key = ?",
        params![store, request_hash(cache_key)],
      )
      .map_err(|e| eyre!("Failed to delete cache entry: {}", e))?;
    prune_metadata(&tx, store)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(removed > 0)
  }

  fn keys(&self, store: &str) -> Result<Vec<String>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT url FROM cache_entries WHERE store = ? ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let urls = stmt
      .query_map(params![store], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache keys: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache keys: {}", e))?;

    Ok(urls)
  }

  fn trim(&self, store: &str, policy: &StorePolicy, now: DateTime<Utc>) -> Result<usize> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    let mut removed = 0;

    if let Some(max_age) = policy.max_age {
      let cutoff = (now - max_age).timestamp_millis();
      removed += tx
        .execute(
          "DELETE FROM cache_entries
           WHERE store = ? AND stored_at IS NOT NULL AND stored_at < ?",
          params![store, cutoff],
        )
        .map_err(|e| eyre!("Failed to expire cache entries: {}", e))?;
    }

    if let Some(max_entries) = policy.max_entries {
      let count: i64 = tx
        .query_row(
          "SELECT COUNT(*) FROM cache_entries WHERE store = ?",
          params![store],
          |row| row.get(0),
        )
        .map_err(|e| eyre!("Failed to count cache entries: {}", e))?;
      let count = count as usize;

      if count > max_entries {
        removed += tx
          .execute(
            "DELETE FROM cache_entries WHERE seq IN (
               SELECT seq FROM cache_entries WHERE store = ? ORDER BY seq LIMIT ?
             )",
            params![store, count - max_entries],
          )
          .map_err(|e| eyre!("Failed to evict cache entries: {}", e))?;
      }
    }

    if removed > 0 {
      prune_metadata(&tx, store)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(removed)
  }

  fn store_names(&self) -> Result<Vec<String>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_stores ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read store names: {}", e))?;

    Ok(names)
  }

  fn delete_store(&self, store: &str) -> Result<bool> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_entries WHERE store = ?", params![store])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", store, e))?;
    tx.execute("DELETE FROM cache_metadata WHERE store = ?", params![store])
      .map_err(|e| eyre!("Failed to delete metadata of {}: {}", store, e))?;
    let existed = tx
      .execute("DELETE FROM cache_stores WHERE name = ?", params![store])
      .map_err(|e| eyre!("Failed to delete store {}: {}", store, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(existed > 0)
  }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
  Utc.timestamp_millis_opt(ms).single()
}
