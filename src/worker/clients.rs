//! Pages the worker controls, and the notifications it shows them.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

/// A window the worker can see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Client {
  pub id: u64,
  pub url: Url,
  pub focused: bool,
  /// Whether this worker controls the page
  pub controlled: bool,
}

/// Registry of open windows.
#[derive(Debug, Default)]
pub struct Clients {
  inner: Mutex<ClientsInner>,
}

#[derive(Debug, Default)]
struct ClientsInner {
  next_id: u64,
  windows: BTreeMap<u64, Client>,
}

impl Clients {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a window opened outside the worker. It stays uncontrolled
  /// until the worker claims it.
  #[cfg(test)]
  pub fn add(&self, url: Url) -> Client {
    self.insert(url, false, false)
  }

  /// Every known window, in opening order.
  pub fn match_all(&self) -> Vec<Client> {
    match self.inner.lock() {
      Ok(inner) => inner.windows.values().cloned().collect(),
      Err(e) => {
        warn!("Client registry poisoned: {}", e);
        Vec::new()
      }
    }
  }

  /// Focus a window, unfocusing the rest. Returns the focused window.
  pub fn focus(&self, id: u64) -> Option<Client> {
    let mut inner = self.inner.lock().ok()?;
    if !inner.windows.contains_key(&id) {
      return None;
    }
    for window in inner.windows.values_mut() {
      window.focused = window.id == id;
    }
    inner.windows.get(&id).cloned()
  }

  /// Open a new focused window controlled by the worker.
  pub fn open_window(&self, url: Url) -> Client {
    let client = self.insert(url, true, true);
    info!(id = client.id, url = %client.url, "Opened window");
    client
  }

  /// Take control of every open window. Returns how many changed hands.
  pub fn claim(&self) -> usize {
    let Ok(mut inner) = self.inner.lock() else {
      return 0;
    };
    let mut claimed = 0;
    for window in inner.windows.values_mut().filter(|w| !w.controlled) {
      window.controlled = true;
      claimed += 1;
    }
    debug!(claimed, "Claimed clients");
    claimed
  }

  fn insert(&self, url: Url, focused: bool, controlled: bool) -> Client {
    let mut inner = match self.inner.lock() {
      Ok(inner) => inner,
      Err(poisoned) => poisoned.into_inner(),
    };
    inner.next_id += 1;
    let id = inner.next_id;
    if focused {
      for window in inner.windows.values_mut() {
        window.focused = false;
      }
    }
    let client = Client {
      id,
      url,
      focused,
      controlled,
    };
    inner.windows.insert(id, client.clone());
    client
  }
}

/// A button shown on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
}

/// A shown notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub id: u64,
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  /// Page to bring up when the notification is clicked
  pub url: Option<String>,
  pub actions: Vec<NotificationAction>,
}

impl Notification {
  pub fn default_actions() -> Vec<NotificationAction> {
    vec![
      NotificationAction {
        action: "open".to_string(),
        title: "Открыть".to_string(),
      },
      NotificationAction {
        action: "close".to_string(),
        title: "Закрыть".to_string(),
      },
    ]
  }
}

/// What a notification click did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
  /// An open window already showed the target URL
  Focused(Client),
  Opened(Client),
  /// The close action was chosen
  Dismissed,
}

/// Notifications currently on screen.
#[derive(Debug, Default)]
pub struct Notifications {
  next_id: AtomicU64,
  inner: Mutex<BTreeMap<u64, Notification>>,
}

impl Notifications {
  pub fn new() -> Self {
    Self::default()
  }

  /// Show a notification. Its id is assigned here.
  pub fn show(&self, mut notification: Notification) -> Notification {
    let mut shown = match self.inner.lock() {
      Ok(shown) => shown,
      Err(poisoned) => poisoned.into_inner(),
    };
    notification.id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    shown.insert(notification.id, notification.clone());
    info!(id = notification.id, title = %notification.title, "Showing notification");
    notification
  }

  /// Remove a notification from screen, returning it if it was shown.
  pub fn close(&self, id: u64) -> Option<Notification> {
    self.inner.lock().ok()?.remove(&id)
  }

  #[cfg(test)]
  pub fn shown(&self) -> Vec<Notification> {
    self
      .inner
      .lock()
      .map(|shown| shown.values().cloned().collect())
      .unwrap_or_default()
  }
}
