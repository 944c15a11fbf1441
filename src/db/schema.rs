/// Schema for the worker database.
pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Named cache partitions, e.g. "api-cache-v3"
CREATE TABLE IF NOT EXISTS cache_stores (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses; seq reflects insertion order and drives FIFO eviction
CREATE TABLE IF NOT EXISTS cache_entries (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    store TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at INTEGER,
    UNIQUE (store, request_key),
    FOREIGN KEY (store) REFERENCES cache_stores(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_store ON cache_entries(store, seq);

-- Last write per URL across all stores
CREATE TABLE IF NOT EXISTS cache_metadata (
    url TEXT PRIMARY KEY,
    store TEXT NOT NULL,
    stored_at INTEGER NOT NULL
);

-- Failed POST requests waiting for replay
CREATE TABLE IF NOT EXISTS post_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    body TEXT NOT NULL,
    enqueued_at INTEGER NOT NULL
);
"#;
