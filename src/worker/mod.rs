//! The service worker: routing, fetch handling and lifecycle events over the
//! cache stores and the request queue.

mod clients;
mod interceptor;
mod lifecycle;
mod router;
mod tasks;

use color_eyre::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::cache::{CacheLayer, Served, SqliteStorage, StoreKind};
use crate::config::Config;
use crate::db::Database;
use crate::event::{FetchEvent, WorkerEvent};
use crate::net::{Network, Request};
use crate::queue::{ReplayReport, RequestQueue};

pub use clients::{ClickOutcome, Notification};
pub use lifecycle::WorkerState;

use clients::{Clients, Notifications};
use interceptor::FetchInterceptor;
use router::{route, Strategy};
use tasks::BackgroundTasks;

/// What handling an event produced.
#[derive(Debug)]
pub enum Outcome {
  /// Precached, then activated straight away
  Installed { precached: usize, purged: Vec<String> },
  Activated { purged: Vec<String> },
  Served(Served),
  Replayed(ReplayReport),
  Refreshed(usize),
  Notified(Notification),
  Clicked(ClickOutcome),
  Cleared(usize),
  /// Unknown tag or message
  Ignored,
}

/// One worker generation, identified by its cache version.
pub struct ServiceWorker {
  config: Arc<Config>,
  cache: CacheLayer,
  queue: Arc<RequestQueue>,
  network: Arc<dyn Network>,
  background: Arc<BackgroundTasks>,
  interceptor: FetchInterceptor,
  clients: Clients,
  notifications: Notifications,
  state: Mutex<WorkerState>,
  navigation_preload: AtomicBool,
}

impl ServiceWorker {
  pub fn new(config: Arc<Config>, db: Arc<Database>, network: Arc<dyn Network>) -> Self {
    let cache = CacheLayer::new(Arc::new(SqliteStorage::new(db.clone())), config.clone());
    let queue = Arc::new(RequestQueue::new(db, config.queue_retention()));
    let background = Arc::new(BackgroundTasks::default());
    let interceptor = FetchInterceptor::new(
      config.clone(),
      cache.clone(),
      queue.clone(),
      network.clone(),
      background.clone(),
    );

    Self {
      config,
      cache,
      queue,
      network,
      background,
      interceptor,
      clients: Clients::new(),
      notifications: Notifications::new(),
      state: Mutex::new(WorkerState::Parsed),
      navigation_preload: AtomicBool::new(false),
    }
  }

  /// Pick up a generation installed by an earlier run: if its static store
  /// exists it is treated as active.
  pub fn resume(&self) -> Result<bool> {
    let static_store = self.cache.name(StoreKind::Static);
    if !self.cache.store_names()?.contains(&static_store) {
      return Ok(false);
    }
    self.enable_navigation_preload();
    self.set_state(WorkerState::Activated);
    debug!(store = %static_store, "Resumed installed worker");
    Ok(true)
  }

  pub async fn dispatch(&self, event: WorkerEvent) -> Result<Outcome> {
    let outcome = match event {
      WorkerEvent::Install => {
        let precached = self.install().await?;
        // Never waits behind an older generation
        let purged = self.activate().await?;
        Outcome::Installed { precached, purged }
      }
      WorkerEvent::Activate => Outcome::Activated {
        purged: self.activate().await?,
      },
      WorkerEvent::Fetch(event) => Outcome::Served(self.fetch(event).await),
      WorkerEvent::Sync { tag } => match self.sync(&tag).await? {
        Some(report) => Outcome::Replayed(report),
        None => Outcome::Ignored,
      },
      WorkerEvent::PeriodicSync { tag } => match self.periodic_sync(&tag).await? {
        Some(refreshed) => Outcome::Refreshed(refreshed),
        None => Outcome::Ignored,
      },
      WorkerEvent::Push { payload } => Outcome::Notified(self.push(payload.as_deref())),
      WorkerEvent::NotificationClick {
        notification_id,
        action,
      } => Outcome::Clicked(self.notification_click(notification_id, action.as_deref())?),
      WorkerEvent::Message(message) => match self.message(&message).await? {
        Some(cleared) => Outcome::Cleared(cleared),
        None => Outcome::Ignored,
      },
    };
    Ok(outcome)
  }

  /// Answer an intercepted request. Navigations get a preload response when
  /// preload is enabled and the event does not carry one already.
  ///
  /// The preload is the navigation's only network attempt: when it fails the
  /// offline page is served without fetching again.
  pub async fn fetch(&self, event: FetchEvent) -> Served {
    if event.preload.is_some()
      || !self.navigation_preload_enabled()
      || route(&event.request, &self.config) != Strategy::Navigation
    {
      return self.interceptor.handle(event).await;
    }

    match self.network.fetch(&event.request).await {
      Ok(response) => self.interceptor.handle(event.with_preload(response)).await,
      Err(e) => {
        debug!(url = %event.request.url, "Navigation preload failed: {}", e);
        self.interceptor.offline_page()
      }
    }
  }

  /// Whether the origin answers at all.
  pub async fn check_online(&self) -> bool {
    let ping = Request::get(self.config.origin.clone());
    self.network.fetch(&ping).await.is_ok()
  }

  /// Wait for background revalidations to finish.
  pub async fn settle(&self) {
    let pending = self.background.pending();
    if pending > 0 {
      info!(pending, "Waiting for background tasks");
    }
    self.background.settle().await;
  }

  pub fn state(&self) -> WorkerState {
    self.state.lock().map(|state| *state).unwrap_or_default()
  }

  fn set_state(&self, next: WorkerState) {
    let mut state = match self.state.lock() {
      Ok(state) => state,
      Err(poisoned) => poisoned.into_inner(),
    };
    if *state != next {
      debug!(from = ?*state, to = ?next, "Worker state changed");
      *state = next;
    }
  }

  fn enable_navigation_preload(&self) {
    self.navigation_preload.store(true, Ordering::SeqCst);
  }

  pub fn navigation_preload_enabled(&self) -> bool {
    self.navigation_preload.load(Ordering::SeqCst)
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn cache(&self) -> &CacheLayer {
    &self.cache
  }

  pub fn queue(&self) -> &RequestQueue {
    &self.queue
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::ResponseSource;
  use crate::event::ClientMessage;
  use crate::net::mock::MockNetwork;
  use crate::net::Response;
  use url::Url;

  fn worker(network: Arc<MockNetwork>) -> ServiceWorker {
    let config = Config {
      precache: vec!["/".to_string(), "/offline".to_string()],
      ..Config::default()
    };
    let db = Arc::new(Database::open_in_memory().unwrap());
    ServiceWorker::new(Arc::new(config), db, network)
  }

  fn url(path: &str) -> Url {
    Url::parse("http://localhost:5000").unwrap().join(path).unwrap()
  }

  #[tokio::test]
  async fn test_install_event_activates_immediately() {
    let network = MockNetwork::new();
    network.respond(url("/").as_str(), Response::new(200, "home"));
    network.respond(url("/offline").as_str(), Response::new(200, "offline"));
    let sw = worker(network);

    let outcome = sw.dispatch(WorkerEvent::Install).await.unwrap();
    assert!(matches!(outcome, Outcome::Installed { precached: 2, .. }));
    assert_eq!(sw.state(), WorkerState::Activated);
    assert!(sw.navigation_preload_enabled());
  }

  #[tokio::test]
  async fn test_navigation_uses_preload_once_active() {
    let network = MockNetwork::new();
    network.respond(url("/").as_str(), Response::new(200, "home"));
    network.respond(url("/offline").as_str(), Response::new(200, "offline"));
    let sw = worker(network.clone());
    sw.dispatch(WorkerEvent::Install).await.unwrap();

    let event = FetchEvent::new(Request::navigate(url("/")));
    match sw.dispatch(WorkerEvent::Fetch(event)).await.unwrap() {
      Outcome::Served(served) => {
        assert_eq!(served.source, ResponseSource::Preload);
        assert_eq!(served.response.text(), "home");
      }
      other => panic!("unexpected outcome: {:?}", other),
    }

    network.set_online(false);
    let event = FetchEvent::new(Request::navigate(url("/dashboard")));
    match sw.dispatch(WorkerEvent::Fetch(event)).await.unwrap() {
      Outcome::Served(served) => {
        assert_eq!(served.source, ResponseSource::OfflineFallback);
        assert_eq!(served.response.text(), "offline");
      }
      other => panic!("unexpected outcome: {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_offline_navigation_hits_network_once() {
    let network = MockNetwork::new();
    network.respond(url("/").as_str(), Response::new(200, "home"));
    network.respond(url("/offline").as_str(), Response::new(200, "offline"));
    let sw = worker(network.clone());
    sw.dispatch(WorkerEvent::Install).await.unwrap();

    network.set_online(false);
    let dashboard = url("/dashboard");
    let served = sw.fetch(FetchEvent::new(Request::navigate(dashboard.clone()))).await;
    assert_eq!(served.source, ResponseSource::OfflineFallback);
    assert_eq!(network.calls_to(dashboard.as_str()), 1);
  }

  #[tokio::test]
  async fn test_navigation_without_preload_fetches_directly() {
    let network = MockNetwork::new();
    network.respond(url("/about").as_str(), Response::new(200, "about"));
    let sw = worker(network.clone());

    let about = url("/about");
    let served = sw.fetch(FetchEvent::new(Request::navigate(about.clone()))).await;
    assert_eq!(served.source, ResponseSource::Network);
    assert_eq!(network.calls_to(about.as_str()), 1);
  }

  #[tokio::test]
  async fn test_resume_requires_installed_generation() {
    let sw = worker(MockNetwork::new());
    assert!(!sw.resume().unwrap());
    assert_eq!(sw.state(), WorkerState::Parsed);

    sw.cache().open(StoreKind::Static).unwrap();
    assert!(sw.resume().unwrap());
    assert_eq!(sw.state(), WorkerState::Activated);
  }

  #[tokio::test]
  async fn test_connectivity_restored_sync_drains_queue() {
    let network = MockNetwork::new();
    let sw = worker(network.clone());

    network.set_online(false);
    assert!(!sw.check_online().await);
    let post = Request::post(url("/submit"), r#"{"name":"x"}"#);
    sw.dispatch(WorkerEvent::Fetch(FetchEvent::new(post)))
      .await
      .unwrap();
    assert_eq!(sw.queue().len().unwrap(), 1);

    network.set_online(true);
    network.respond(url("/submit").as_str(), Response::new(200, "ok"));
    assert!(sw.check_online().await);
    let outcome = sw
      .dispatch(WorkerEvent::Sync {
        tag: "sync-queue".to_string(),
      })
      .await
      .unwrap();
    match outcome {
      Outcome::Replayed(report) => assert_eq!(report.replayed, 1),
      other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(sw.queue().len().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_unknown_message_is_ignored() {
    let sw = worker(MockNetwork::new());
    let outcome = sw
      .dispatch(WorkerEvent::Message(ClientMessage::parse("SKIP")))
      .await
      .unwrap();
    assert!(matches!(outcome, Outcome::Ignored));
  }
}
