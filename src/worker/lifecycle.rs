//! Install, activate and the non-fetch events.

use color_eyre::{eyre::eyre, Result};
use futures::future::{join_all, try_join_all};
use tracing::{debug, info, warn};

use super::clients::{ClickOutcome, Notification};
use super::ServiceWorker;
use crate::cache::StoreKind;
use crate::event::{ClientMessage, PushPayload};
use crate::net::{Request, Response};
use crate::queue::ReplayReport;

const VIBRATE_PATTERN: [u32; 3] = [100, 50, 100];

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkerState {
  /// Created, nothing run yet
  #[default]
  Parsed,
  Installing,
  /// Precached, waiting for activation
  Installed,
  Activating,
  /// Controlling pages
  Activated,
  /// Install failed
  Redundant,
}

impl ServiceWorker {
  /// Precache the app shell into the static store.
  ///
  /// All-or-nothing: if any URL fails or answers with an error status,
  /// nothing is written and the worker becomes redundant.
  pub async fn install(&self) -> Result<usize> {
    self.set_state(WorkerState::Installing);

    match self.precache().await {
      Ok(count) => {
        info!(count, "Precached app shell");
        self.set_state(WorkerState::Installed);
        Ok(count)
      }
      Err(e) => {
        warn!("Install failed: {}", e);
        self.set_state(WorkerState::Redundant);
        Err(e)
      }
    }
  }

  async fn precache(&self) -> Result<usize> {
    let requests = self
      .config
      .precache
      .iter()
      .map(|path| self.config.resolve(path).map(Request::get))
      .collect::<Result<Vec<_>>>()?;

    let network = &self.network;
    let responses: Vec<Response> = try_join_all(requests.iter().map(|request| async move {
      let response = network.fetch(request).await?;
      if !response.ok() {
        return Err(eyre!(
          "Failed to precache {}: status {}",
          request.url,
          response.status
        ));
      }
      Ok(response)
    }))
    .await?;

    let entries: Vec<(Request, Response)> = requests.into_iter().zip(responses).collect();
    // The store marks this generation as installed even when nothing is precached
    self.cache.open(StoreKind::Static)?;
    self.cache.put_all(StoreKind::Static, &entries)?;
    Ok(entries.len())
  }

  /// Drop stores of older versions, turn on navigation preload and take
  /// control of open pages. Returns the purged store names.
  pub async fn activate(&self) -> Result<Vec<String>> {
    self.set_state(WorkerState::Activating);

    let purged = self.cache.purge_obsolete()?;
    self.enable_navigation_preload();
    let claimed = self.clients.claim();

    self.set_state(WorkerState::Activated);
    info!(purged = purged.len(), claimed, "Worker activated");
    Ok(purged)
  }

  /// Background sync. Tags other than the queue tag are ignored.
  pub async fn sync(&self, tag: &str) -> Result<Option<ReplayReport>> {
    if tag != self.config.sync.queue_tag {
      debug!(tag, "Ignoring sync tag");
      return Ok(None);
    }
    self.replay().await.map(Some)
  }

  pub async fn replay(&self) -> Result<ReplayReport> {
    self.queue.replay_all(self.network.as_ref()).await
  }

  /// Periodic sync. Tags other than the periodic tag are ignored.
  pub async fn periodic_sync(&self, tag: &str) -> Result<Option<usize>> {
    if tag != self.config.sync.periodic_tag {
      debug!(tag, "Ignoring periodic sync tag");
      return Ok(None);
    }
    Ok(Some(self.refresh().await))
  }

  /// Refetch the periodic URLs into the api store. Returns how many were
  /// refreshed; failures are logged and skipped.
  pub async fn refresh(&self) -> usize {
    let fetches = self.config.sync.periodic_urls.iter().map(|path| async move {
      let request = self.config.resolve(path).map(Request::get)?;
      let response = self.network.fetch(&request).await?;
      if !response.ok() {
        return Err(eyre!("Failed to refresh {}: status {}", request.url, response.status));
      }
      self.cache.put(StoreKind::Api, &request, &response)
    });

    let mut refreshed = 0;
    for result in join_all(fetches).await {
      match result {
        Ok(()) => refreshed += 1,
        Err(e) => warn!("{}", e),
      }
    }
    debug!(refreshed, "Periodic refresh done");
    refreshed
  }

  /// Show a notification built from the push payload over the configured
  /// defaults.
  pub fn push(&self, payload: Option<&[u8]>) -> Notification {
    let payload = PushPayload::parse(payload);
    let defaults = &self.config.notifications;

    self.notifications.show(Notification {
      id: 0,
      title: payload.title.unwrap_or_else(|| defaults.title.clone()),
      body: payload.body.unwrap_or_else(|| defaults.body.clone()),
      icon: payload.icon.unwrap_or_else(|| defaults.icon.clone()),
      badge: defaults.badge.clone(),
      vibrate: VIBRATE_PATTERN.to_vec(),
      url: payload.url,
      actions: Notification::default_actions(),
    })
  }

  /// Close the notification, then bring its page up unless `close` was
  /// chosen. A window already showing the exact URL is focused; otherwise a
  /// new one is opened.
  pub fn notification_click(
    &self,
    notification_id: u64,
    action: Option<&str>,
  ) -> Result<ClickOutcome> {
    let notification = self
      .notifications
      .close(notification_id)
      .ok_or_else(|| eyre!("Notification {} is not shown", notification_id))?;

    if action == Some("close") {
      return Ok(ClickOutcome::Dismissed);
    }

    let target = self
      .config
      .resolve(notification.url.as_deref().unwrap_or("/"))?;

    let existing = self
      .clients
      .match_all()
      .into_iter()
      .find(|client| client.url == target);
    if let Some(client) = existing {
      if let Some(focused) = self.clients.focus(client.id) {
        return Ok(ClickOutcome::Focused(focused));
      }
    }

    Ok(ClickOutcome::Opened(self.clients.open_window(target)))
  }

  /// Handle a page message. Returns the number of stores cleared, if any.
  pub async fn message(&self, message: &ClientMessage) -> Result<Option<usize>> {
    match message {
      ClientMessage::ClearCache => self.cache.clear().map(Some),
      ClientMessage::SyncPosts => {
        self.replay().await?;
        Ok(None)
      }
      ClientMessage::Other(other) => {
        debug!(message = %other, "Ignoring client message");
        Ok(None)
      }
    }
  }
}
