//! Network access for the worker.
//!
//! Everything the worker sends goes through the [`Network`] trait so the
//! interceptor can be driven by the live client or by a scripted one.

mod client;
mod types;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;

pub use client::HttpNetwork;
pub use types::{Destination, Request, RequestMode, Response};

#[async_trait]
pub trait Network: Send + Sync + 'static {
  /// Issue the request. `Err` means the request never produced a response
  /// (connectivity, DNS, TLS); HTTP error statuses are `Ok`.
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Outcome of racing a fetch against a timer.
#[derive(Debug)]
pub enum Race<T> {
  Settled(T),
  TimedOut,
}

/// Race a network fetch against `limit`.
///
/// The fetch runs as its own task. If the timer wins the task is detached,
/// not cancelled; it finishes on its own and its result is dropped.
pub async fn fetch_with_timeout(
  network: Arc<dyn Network>,
  request: Request,
  limit: Duration,
) -> Race<Result<Response>> {
  let handle = tokio::spawn(async move { network.fetch(&request).await });

  tokio::select! {
    joined = handle => match joined {
      Ok(result) => Race::Settled(result),
      Err(e) => Race::Settled(Err(eyre!("Network task failed: {}", e))),
    },
    _ = tokio::time::sleep(limit) => Race::TimedOut,
  }
}

#[cfg(test)]
pub mod mock {
  //! Scripted network for tests.

  use super::*;
  use std::collections::{HashMap, VecDeque};
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Mutex;

  /// Answers from a per-URL script. The last scripted response for a URL
  /// repeats; unscripted URLs get a 404. While offline every fetch fails.
  pub struct MockNetwork {
    script: Mutex<HashMap<String, VecDeque<Response>>>,
    delays: Mutex<HashMap<String, Duration>>,
    online: AtomicBool,
    calls: Mutex<Vec<Request>>,
  }

  impl MockNetwork {
    pub fn new() -> Arc<Self> {
      Arc::new(Self {
        script: Mutex::new(HashMap::new()),
        delays: Mutex::new(HashMap::new()),
        online: AtomicBool::new(true),
        calls: Mutex::new(Vec::new()),
      })
    }

    pub fn respond(&self, url: &str, response: Response) {
      self
        .script
        .lock()
        .unwrap()
        .entry(url.to_string())
        .or_default()
        .push_back(response);
    }

    pub fn delay(&self, url: &str, delay: Duration) {
      self.delays.lock().unwrap().insert(url.to_string(), delay);
    }

    pub fn set_online(&self, online: bool) {
      self.online.store(online, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Request> {
      self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, url: &str) -> usize {
      self
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.url.as_str() == url)
        .count()
    }
  }

  #[async_trait]
  impl Network for MockNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response> {
      self.calls.lock().unwrap().push(request.clone());

      let url = request.url.to_string();
      let delay = self.delays.lock().unwrap().get(&url).copied();
      if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
      }

      if !self.online.load(Ordering::SeqCst) {
        return Err(eyre!("Failed to fetch {}: network unreachable", url));
      }

      let mut script = self.script.lock().unwrap();
      match script.get_mut(&url) {
        Some(queue) if queue.len() > 1 => Ok(queue.pop_front().unwrap()),
        Some(queue) if !queue.is_empty() => Ok(queue[0].clone()),
        _ => Ok(Response::new(404, "not found")),
      }
    }
  }
}
