//! Fetch handling: runs the strategy the router picks for each request.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use super::router::{route, Strategy};
use super::tasks::BackgroundTasks;
use crate::cache::{CacheLayer, CachedResponse, ResponseSource, Served, StoreKind, STALE_HEADER};
use crate::config::Config;
use crate::event::FetchEvent;
use crate::net::{fetch_with_timeout, Network, Race, Request, Response};
use crate::queue::RequestQueue;

/// Answers every intercepted request with exactly one response.
///
/// Network failures never escape: they turn into cached copies, queue
/// acknowledgements, the offline page or a synthesized 503.
pub struct FetchInterceptor {
  config: Arc<Config>,
  cache: CacheLayer,
  queue: Arc<RequestQueue>,
  network: Arc<dyn Network>,
  background: Arc<BackgroundTasks>,
}

impl FetchInterceptor {
  pub fn new(
    config: Arc<Config>,
    cache: CacheLayer,
    queue: Arc<RequestQueue>,
    network: Arc<dyn Network>,
    background: Arc<BackgroundTasks>,
  ) -> Self {
    Self {
      config,
      cache,
      queue,
      network,
      background,
    }
  }

  pub async fn handle(&self, event: FetchEvent) -> Served {
    let FetchEvent { request, preload } = event;
    let strategy = route(&request, &self.config);
    debug!(method = %request.method, url = %request.url, ?strategy, store = ?strategy.store(), "Intercepted request");

    match strategy {
      Strategy::Bypass | Strategy::NetworkOnly => self.network_only(&request).await,
      Strategy::Navigation => self.navigation(&request, preload).await,
      Strategy::QueueOnFailure => self.queue_on_failure(&request).await,
      Strategy::NetworkFirstWithTimeout(kind) => self.network_first_with_timeout(kind, request).await,
      Strategy::CacheFirst(kind) => self.cache_first(kind, &request).await,
      Strategy::CacheFirstRevalidate(kind) | Strategy::StaleWhileRevalidate(kind) => {
        self.stale_while_revalidate(kind, request).await
      }
    }
  }

  async fn network_only(&self, request: &Request) -> Served {
    match self.network.fetch(request).await {
      Ok(response) => Served::network(response),
      Err(e) => {
        warn!("{}", e);
        Served::synthesized(Response::service_unavailable("Service Unavailable"))
      }
    }
  }

  async fn navigation(&self, request: &Request, preload: Option<Response>) -> Served {
    if let Some(preloaded) = preload {
      return Served::new(preloaded, ResponseSource::Preload);
    }

    match self.network.fetch(request).await {
      Ok(response) if response.ok() => return Served::network(response),
      Ok(response) => debug!(status = response.status, url = %request.url, "Navigation failed"),
      Err(e) => debug!("Navigation failed: {}", e),
    }

    self.offline_page()
  }

  /// The precached offline page, or a 503 when it was never cached.
  pub fn offline_page(&self) -> Served {
    let lookup = self
      .config
      .resolve(&self.config.offline_url)
      .and_then(|url| self.cache.match_any(&Request::get(url)));

    match lookup {
      Ok(Some(cached)) => {
        debug!(store = %cached.store, url = %cached.url, "Serving offline page");
        Served::new(cached.response, ResponseSource::OfflineFallback)
      }
      Ok(None) => Served::synthesized(Response::service_unavailable("Offline page not found")),
      Err(e) => {
        warn!("Failed to read offline page: {}", e);
        Served::synthesized(Response::service_unavailable("Offline page not found"))
      }
    }
  }

  async fn queue_on_failure(&self, request: &Request) -> Served {
    let err = match self.network.fetch(request).await {
      Ok(response) => return Served::network(response),
      Err(e) => e,
    };
    warn!("POST failed, queueing for replay: {}", err);

    match self.queue.enqueue(request) {
      Ok(_) => {
        let ack = json!({ "queued": true, "timestamp": Utc::now().timestamp_millis() });
        let response = Response::json(200, &ack).with_header("Cache-Control", "no-store");
        Served::new(response, ResponseSource::Queued)
      }
      Err(e) => {
        warn!("Failed to queue request: {}", e);
        let body = json!({ "queued": false, "error": "Request could not be sent or queued" });
        Served::synthesized(Response::json(503, &body))
      }
    }
  }

  async fn network_first_with_timeout(&self, kind: StoreKind, request: Request) -> Served {
    let outcome = fetch_with_timeout(
      Arc::clone(&self.network),
      request.clone(),
      self.config.api_timeout(),
    )
    .await;

    match outcome {
      Race::Settled(Ok(response)) if response.ok() => {
        if let Err(e) = self.cache.put(kind, &request, &response) {
          warn!("Failed to cache {}: {}", request.url, e);
        }
        return Served::network(response);
      }
      Race::Settled(Ok(response)) => {
        debug!(status = response.status, url = %request.url, "API request failed")
      }
      Race::Settled(Err(e)) => debug!("API request failed: {}", e),
      Race::TimedOut => debug!(url = %request.url, "API request timed out"),
    }

    match self.cached(kind, &request) {
      Some(cached) if self.cache.is_fresh(kind, &cached) => Served::cache(cached),
      Some(cached) => {
        let response = cached
          .response
          .with_header(STALE_HEADER, "Data may be stale")
          .with_status_text("Stale data");
        Served::new(response, ResponseSource::CacheStale)
      }
      None => Served::synthesized(Response::json(
        503,
        &json!({ "error": "Failed to fetch data" }),
      )),
    }
  }

  async fn cache_first(&self, kind: StoreKind, request: &Request) -> Served {
    if let Some(cached) = self.cached(kind, request) {
      return Served::cache(cached);
    }
    self.fetch_and_cache(kind, request).await
  }

  /// Serve the cached copy right away and refresh it in the background;
  /// with nothing cached, wait on the network.
  async fn stale_while_revalidate(&self, kind: StoreKind, request: Request) -> Served {
    match self.cached(kind, &request) {
      Some(cached) => {
        self.revalidate(kind, request);
        Served::cache(cached)
      }
      None => self.fetch_and_cache(kind, &request).await,
    }
  }

  fn revalidate(&self, kind: StoreKind, request: Request) {
    let network = Arc::clone(&self.network);
    let cache = self.cache.clone();

    self.background.spawn(async move {
      match network.fetch(&request).await {
        Ok(response) if response.ok() => {
          if let Err(e) = cache.put(kind, &request, &response) {
            warn!("Failed to refresh {}: {}", request.url, e);
          }
        }
        Ok(response) => debug!(status = response.status, url = %request.url, "Revalidation skipped"),
        Err(e) => debug!("Revalidation failed: {}", e),
      }
    });
  }

  async fn fetch_and_cache(&self, kind: StoreKind, request: &Request) -> Served {
    match self.network.fetch(request).await {
      Ok(response) => {
        if response.ok() {
          if let Err(e) = self.cache.put(kind, request, &response) {
            warn!("Failed to cache {}: {}", request.url, e);
          }
        }
        Served::network(response)
      }
      Err(e) => {
        warn!("{}", e);
        Served::synthesized(Response::service_unavailable("Service Unavailable"))
      }
    }
  }

  /// Cache lookup where a storage error counts as a miss.
  fn cached(&self, kind: StoreKind, request: &Request) -> Option<CachedResponse> {
    match self.cache.lookup(kind, request) {
      Ok(found) => found,
      Err(e) => {
        warn!("Cache read failed for {}: {}", request.url, e);
        None
      }
    }
  }
}
