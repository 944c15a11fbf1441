use chrono::{DateTime, Duration, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::types::{QueuedBody, QueuedRequest, ReplayReport};
use crate::db::Database;
use crate::net::{Network, Request};

/// Durable FIFO of failed mutating requests.
///
/// Each operation runs under the database lock on its own, so queue
/// bookkeeping never interleaves. Two overlapping replays can still send the
/// same entry twice; the second delete is a no-op.
pub struct RequestQueue {
  db: Arc<Database>,
  retention: Duration,
}

impl RequestQueue {
  pub fn new(db: Arc<Database>, retention: Duration) -> Self {
    Self { db, retention }
  }

  /// Persist a request. Returns its id.
  pub fn enqueue(&self, request: &Request) -> Result<i64> {
    let conn = self.db.lock()?;
    let headers = serde_json::to_string(&request.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;
    let body = serde_json::to_string(&QueuedBody::parse(request.body.as_deref()))
      .map_err(|e| eyre!("Failed to serialize body: {}", e))?;

    conn
      .execute(
        "INSERT INTO post_requests (url, method, headers, body, enqueued_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
          request.url.as_str(),
          request.method.as_str(),
          headers,
          body,
          Utc::now().timestamp_millis()
        ],
      )
      .map_err(|e| eyre!("Failed to queue request to {}: {}", request.url, e))?;

    let id = conn.last_insert_rowid();
    debug!(id, url = %request.url, "Queued request");
    Ok(id)
  }

  /// Every queued request in insertion order.
  pub fn entries(&self) -> Result<Vec<QueuedRequest>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, url, method, headers, body, enqueued_at FROM post_requests ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, String>(4)?,
          row.get::<_, i64>(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query queue: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read queue: {}", e))?;

    rows
      .into_iter()
      .map(|(id, url, method, headers, body, enqueued_ms)| {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to parse headers of queued request {}: {}", id, e))?;
        let body = serde_json::from_str(&body)
          .map_err(|e| eyre!("Failed to parse body of queued request {}: {}", id, e))?;
        let enqueued_at = Utc
          .timestamp_millis_opt(enqueued_ms)
          .single()
          .ok_or_else(|| eyre!("Queued request {} has invalid timestamp", id))?;

        Ok(QueuedRequest {
          id,
          url,
          method,
          headers,
          body,
          enqueued_at,
        })
      })
      .collect()
  }

  /// Remove an entry. Removing an entry that is already gone is a no-op.
  pub fn remove(&self, id: i64) -> Result<bool> {
    let conn = self.db.lock()?;
    let removed = conn
      .execute("DELETE FROM post_requests WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove queued request {}: {}", id, e))?;
    Ok(removed > 0)
  }

  pub fn len(&self) -> Result<usize> {
    let conn = self.db.lock()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM post_requests", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count queue: {}", e))?;
    Ok(count as usize)
  }

  /// Re-send every queued request in order.
  ///
  /// Delivered entries are removed. Failed entries stay queued until they are
  /// older than the retention window, then they are dropped whatever happens.
  pub async fn replay_all(&self, network: &dyn Network) -> Result<ReplayReport> {
    let entries = self.entries()?;
    let mut report = ReplayReport::default();

    for entry in entries {
      if self.attempt(network, &entry).await {
        self.remove(entry.id)?;
        report.replayed += 1;
      } else if self.is_expired(&entry, Utc::now()) {
        self.remove(entry.id)?;
        warn!(id = entry.id, url = %entry.url, "Dropped queued request past retention");
        report.expired += 1;
      } else {
        report.retained += 1;
      }
    }

    if report != ReplayReport::default() {
      info!(
        replayed = report.replayed,
        expired = report.expired,
        retained = report.retained,
        "Replayed request queue"
      );
    }
    Ok(report)
  }

  async fn attempt(&self, network: &dyn Network, entry: &QueuedRequest) -> bool {
    let request = match entry.to_request() {
      Ok(request) => request,
      Err(e) => {
        warn!("{}", e);
        return false;
      }
    };

    match network.fetch(&request).await {
      Ok(response) if response.ok() => true,
      Ok(response) => {
        warn!(id = entry.id, status = response.status, "Replay rejected");
        false
      }
      Err(e) => {
        warn!(id = entry.id, "Failed to replay request: {}", e);
        false
      }
    }
  }

  fn is_expired(&self, entry: &QueuedRequest, now: DateTime<Utc>) -> bool {
    entry.age(now) >= self.retention
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::mock::MockNetwork;
  use crate::net::Response;
  use url::Url;

  const SUBMIT: &str = "http://localhost:5000/submit";

  fn queue() -> (Arc<Database>, RequestQueue) {
    let db = Arc::new(Database::open_in_memory().unwrap());
    (db.clone(), RequestQueue::new(db, Duration::hours(24)))
  }

  fn submit(body: &str) -> Request {
    Request::post(Url::parse(SUBMIT).unwrap(), body)
      .with_header("Content-Type", "application/json")
  }

  fn backdate(db: &Database, id: i64, age: Duration) {
    let conn = db.lock().unwrap();
    conn
      .execute(
        "UPDATE post_requests SET enqueued_at = ? WHERE id = ?",
        params![(Utc::now() - age).timestamp_millis(), id],
      )
      .unwrap();
  }

  #[test]
  fn test_enqueue_assigns_monotonic_ids() {
    let (_db, queue) = queue();
    let first = queue.enqueue(&submit(r#"{"n":1}"#)).unwrap();
    let second = queue.enqueue(&submit("plain text")).unwrap();
    assert!(second > first);

    let entries = queue.entries().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].method, "POST");
    assert_eq!(entries[0].body, QueuedBody::Json(serde_json::json!({"n": 1})));
    assert_eq!(entries[1].body, QueuedBody::Text("plain text".to_string()));
    assert_eq!(
      entries[0].headers,
      vec![("Content-Type".to_string(), "application/json".to_string())]
    );
  }

  #[test]
  fn test_enqueue_fails_when_store_unavailable() {
    let (db, queue) = queue();
    db.lock()
      .unwrap()
      .execute_batch("DROP TABLE post_requests")
      .unwrap();
    assert!(queue.enqueue(&submit("{}")).is_err());
  }

  #[tokio::test]
  async fn test_replay_removes_delivered_entries() {
    let (_db, queue) = queue();
    let network = MockNetwork::new();
    network.respond(SUBMIT, Response::new(201, "created"));
    queue.enqueue(&submit(r#"{"n":1}"#)).unwrap();

    let report = queue.replay_all(network.as_ref()).await.unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(queue.len().unwrap(), 0);

    let sent = network.calls();
    assert_eq!(sent[0].method, reqwest::Method::POST);
    assert_eq!(sent[0].body.as_deref(), Some(br#"{"n":1}"#.as_slice()));
    assert_eq!(sent[0].header("content-type"), Some("application/json"));
  }

  #[tokio::test]
  async fn test_replay_keeps_failures_inside_retention() {
    let (_db, queue) = queue();
    let network = MockNetwork::new();
    network.set_online(false);
    queue.enqueue(&submit("{}")).unwrap();

    let report = queue.replay_all(network.as_ref()).await.unwrap();
    assert_eq!(report.retained, 1);

    // Running again without any success changes nothing
    let report = queue.replay_all(network.as_ref()).await.unwrap();
    assert_eq!(report.retained, 1);
    assert_eq!(queue.len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_replay_treats_error_status_as_failure() {
    let (_db, queue) = queue();
    let network = MockNetwork::new();
    network.respond(SUBMIT, Response::new(500, "boom"));
    queue.enqueue(&submit("{}")).unwrap();

    let report = queue.replay_all(network.as_ref()).await.unwrap();
    assert_eq!(report.retained, 1);
    assert_eq!(queue.len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_replay_drops_entries_past_retention() {
    let (db, queue) = queue();
    let network = MockNetwork::new();
    network.set_online(false);
    let old = queue.enqueue(&submit("{}")).unwrap();
    queue.enqueue(&submit("{}")).unwrap();
    backdate(&db, old, Duration::hours(25));

    let report = queue.replay_all(network.as_ref()).await.unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(report.retained, 1);
    assert_eq!(queue.entries().unwrap()[0].id, old + 1);
  }

  #[tokio::test]
  async fn test_duplicate_replay_of_deleted_entry_is_noop() {
    let (_db, queue) = queue();
    let network = MockNetwork::new();
    network.respond(SUBMIT, Response::new(200, "ok"));
    let id = queue.enqueue(&submit("{}")).unwrap();
    let snapshot = queue.entries().unwrap();

    queue.replay_all(network.as_ref()).await.unwrap();
    // A second delivery of the same entry, as from an overlapping replay
    assert!(!queue.remove(snapshot[0].id).unwrap());
    assert!(!queue.remove(id).unwrap());
    assert_eq!(queue.len().unwrap(), 0);

    let report = queue.replay_all(network.as_ref()).await.unwrap();
    assert_eq!(report, ReplayReport::default());
  }

  #[tokio::test]
  async fn test_replay_preserves_order() {
    let (_db, queue) = queue();
    let network = MockNetwork::new();
    network.respond(SUBMIT, Response::new(200, "ok"));
    queue.enqueue(&submit(r#"{"n":1}"#)).unwrap();
    queue.enqueue(&submit(r#"{"n":2}"#)).unwrap();

    queue.replay_all(network.as_ref()).await.unwrap();
    let bodies: Vec<_> = network
      .calls()
      .into_iter()
      .map(|r| String::from_utf8(r.body.unwrap()).unwrap())
      .collect();
    assert_eq!(bodies, vec![r#"{"n":1}"#, r#"{"n":2}"#]);
  }
}
