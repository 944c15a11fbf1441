use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::net::{Request, Response};

/// A request intercepted from a controlled page.
#[derive(Debug, Clone)]
pub struct FetchEvent {
  pub request: Request,
  /// Response the host started fetching before the worker ran, if navigation
  /// preload is enabled
  pub preload: Option<Response>,
}

impl FetchEvent {
  pub fn new(request: Request) -> Self {
    Self {
      request,
      preload: None,
    }
  }

  pub fn with_preload(mut self, preload: Response) -> Self {
    self.preload = Some(preload);
    self
  }
}

/// Messages pages post to the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
  /// Delete every store
  ClearCache,
  /// Replay the request queue now
  SyncPosts,
  Other(String),
}

impl ClientMessage {
  pub fn parse(message: &str) -> Self {
    match message {
      "CLEAR_CACHE" => ClientMessage::ClearCache,
      "syncPosts" => ClientMessage::SyncPosts,
      other => ClientMessage::Other(other.to_string()),
    }
  }
}

/// Worker events
#[derive(Debug)]
pub enum WorkerEvent {
  Install,
  Activate,
  Fetch(FetchEvent),
  /// Background sync, fired when connectivity returns
  Sync { tag: String },
  /// Scheduled refresh
  PeriodicSync { tag: String },
  /// Push message with an optional payload
  Push { payload: Option<Vec<u8>> },
  NotificationClick {
    notification_id: u64,
    action: Option<String>,
  },
  Message(ClientMessage),
}

/// Host signals observed by the watcher
#[derive(Debug)]
pub enum HostEvent {
  /// Periodic tick for scheduled refresh and connectivity polling
  Tick,
  /// Shutdown requested
  Shutdown,
}

/// Event handler that produces ticks on a timer and a shutdown on Ctrl-C
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<HostEvent>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    let tick_tx = tx.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_rate);
      loop {
        interval.tick().await;
        if tick_tx.send(HostEvent::Tick).is_err() {
          break;
        }
      }
    });

    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        let _ = tx.send(HostEvent::Shutdown);
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<HostEvent> {
    self.rx.recv().await
  }
}

/// Fields of a push payload. Missing fields fall back to configured defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushPayload {
  pub title: Option<String>,
  pub body: Option<String>,
  pub icon: Option<String>,
  pub url: Option<String>,
}

impl PushPayload {
  /// Parse a push payload; absent or malformed payloads yield all defaults.
  pub fn parse(payload: Option<&[u8]>) -> Self {
    payload
      .and_then(|bytes| serde_json::from_slice(bytes).ok())
      .unwrap_or_default()
  }
}
