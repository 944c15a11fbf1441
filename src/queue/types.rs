use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::net::Request;

/// Body of a queued request: parsed JSON when it was valid JSON, raw text otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum QueuedBody {
  Empty,
  Json(Value),
  Text(String),
}

impl QueuedBody {
  pub fn parse(body: Option<&[u8]>) -> Self {
    match body {
      None | Some([]) => QueuedBody::Empty,
      Some(bytes) => match serde_json::from_slice(bytes) {
        Ok(value) => QueuedBody::Json(value),
        Err(_) => QueuedBody::Text(String::from_utf8_lossy(bytes).into_owned()),
      },
    }
  }

  /// Bytes to send on replay. Text goes out verbatim, not JSON-quoted.
  pub fn to_bytes(&self) -> Option<Vec<u8>> {
    match self {
      QueuedBody::Empty => None,
      QueuedBody::Json(value) => Some(value.to_string().into_bytes()),
      QueuedBody::Text(text) => Some(text.clone().into_bytes()),
    }
  }
}

/// A mutating request that could not reach the network.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
  pub id: i64,
  pub url: String,
  pub method: String,
  pub headers: Vec<(String, String)>,
  pub body: QueuedBody,
  pub enqueued_at: DateTime<Utc>,
}

impl QueuedRequest {
  /// Rebuild the live request for replay.
  pub fn to_request(&self) -> Result<Request> {
    let url = Url::parse(&self.url)
      .map_err(|e| eyre!("Queued request {} has invalid url '{}': {}", self.id, self.url, e))?;
    let method = Method::from_bytes(self.method.as_bytes())
      .map_err(|e| eyre!("Queued request {} has invalid method '{}': {}", self.id, self.method, e))?;

    let mut request = Request::new(method, url);
    request.headers = self.headers.clone();
    request.body = self.body.to_bytes();
    Ok(request)
  }

  pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
    now - self.enqueued_at
  }
}

/// Summary of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
  /// Delivered and removed
  pub replayed: usize,
  /// Failed and removed for exceeding the retention window
  pub expired: usize,
  /// Failed and kept for the next pass
  pub retained: usize,
}
