//! Request classification.
//!
//! Routing is a pure function of the request and the configuration, so every
//! precedence rule can be checked without a network or a database.

use reqwest::Method;

use crate::cache::StoreKind;
use crate::config::Config;
use crate::net::{Destination, Request, RequestMode};

/// How a request is served, and which store backs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Excluded host or path; straight to the network
  Bypass,
  /// Preload, then network, then the precached offline page
  Navigation,
  /// Network, queueing the request for replay when it cannot be sent
  QueueOnFailure,
  /// Network raced against a timer, cached copy as fallback
  NetworkFirstWithTimeout(StoreKind),
  /// Cached copy if any, otherwise network
  CacheFirst(StoreKind),
  /// Cached copy served at once while a background fetch refreshes it
  CacheFirstRevalidate(StoreKind),
  /// Like `CacheFirstRevalidate`; waits on the network only when nothing is cached
  StaleWhileRevalidate(StoreKind),
  /// Network without caching
  NetworkOnly,
}

impl Strategy {
  pub fn store(&self) -> Option<StoreKind> {
    match self {
      Strategy::Navigation => Some(StoreKind::Static),
      Strategy::NetworkFirstWithTimeout(kind)
      | Strategy::CacheFirst(kind)
      | Strategy::CacheFirstRevalidate(kind)
      | Strategy::StaleWhileRevalidate(kind) => Some(*kind),
      Strategy::Bypass | Strategy::QueueOnFailure | Strategy::NetworkOnly => None,
    }
  }
}

/// Pick the strategy for a request. First matching rule wins.
pub fn route(request: &Request, config: &Config) -> Strategy {
  let url = &request.url;
  let host = url.host_str().unwrap_or_default();
  let same_origin = url.origin() == config.origin.origin();

  let excluded_host = config.routes.excluded_hosts.iter().any(|h| h == host);
  let excluded_path = same_origin
    && config
      .routes
      .excluded_path_prefixes
      .iter()
      .any(|prefix| url.path().starts_with(prefix.as_str()));
  if excluded_host || excluded_path {
    return Strategy::Bypass;
  }

  if request.mode == RequestMode::Navigate {
    return Strategy::Navigation;
  }

  if request.method == Method::POST {
    return Strategy::QueueOnFailure;
  }

  // Only GETs are ever cached
  if request.method != Method::GET {
    return Strategy::NetworkOnly;
  }

  if same_origin && url.path().starts_with(config.routes.api_prefix.as_str()) {
    return Strategy::NetworkFirstWithTimeout(StoreKind::Api);
  }

  if config.routes.font_hosts.iter().any(|h| h == host) {
    return Strategy::CacheFirst(StoreKind::Font);
  }

  if request.destination == Destination::Image {
    return Strategy::CacheFirstRevalidate(StoreKind::Image);
  }

  if same_origin {
    return Strategy::StaleWhileRevalidate(StoreKind::Runtime);
  }

  Strategy::NetworkOnly
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  fn strategy(request: &Request) -> Strategy {
    route(request, &Config::default())
  }

  #[test]
  fn test_admin_bypasses_everything() {
    let nav = Request::navigate(url("http://localhost:5000/admin/map"));
    assert_eq!(strategy(&nav), Strategy::Bypass);

    let post = Request::post(url("http://localhost:5000/admin/entries"), "{}");
    assert_eq!(strategy(&post), Strategy::Bypass);
  }

  #[test]
  fn test_analytics_host_bypasses() {
    let request = Request::get(url("https://www.google-analytics.com/collect?v=1"));
    assert_eq!(strategy(&request), Strategy::Bypass);
    assert_eq!(strategy(&request).store(), None);
  }

  #[test]
  fn test_admin_prefix_on_other_origin_is_not_excluded() {
    let request = Request::get(url("https://cdn.example.com/admin/logo.png"))
      .with_destination(Destination::Image);
    assert_eq!(
      strategy(&request),
      Strategy::CacheFirstRevalidate(StoreKind::Image)
    );
  }

  #[test]
  fn test_navigation_beats_api_prefix() {
    let request = Request::navigate(url("http://localhost:5000/api/stats"));
    assert_eq!(strategy(&request), Strategy::Navigation);
    assert_eq!(strategy(&request).store(), Some(StoreKind::Static));
  }

  #[test]
  fn test_post_is_queued_even_for_api() {
    let request = Request::post(url("http://localhost:5000/api/entries"), "{}");
    assert_eq!(strategy(&request), Strategy::QueueOnFailure);
  }

  #[test]
  fn test_other_mutations_are_not_cached() {
    let request = Request::new(Method::DELETE, url("http://localhost:5000/api/entries/4"));
    assert_eq!(strategy(&request), Strategy::NetworkOnly);
  }

  #[test]
  fn test_api_route() {
    let request = Request::get(url("http://localhost:5000/api/stats"));
    assert_eq!(
      strategy(&request),
      Strategy::NetworkFirstWithTimeout(StoreKind::Api)
    );
  }

  #[test]
  fn test_font_hosts_are_cache_first() {
    let css = Request::get(url("https://fonts.googleapis.com/css2?family=Poppins"));
    let woff = Request::get(url("https://fonts.gstatic.com/s/poppins/v20/a.woff2"))
      .with_destination(Destination::Font);
    assert_eq!(strategy(&css), Strategy::CacheFirst(StoreKind::Font));
    assert_eq!(strategy(&woff), Strategy::CacheFirst(StoreKind::Font));
  }

  #[test]
  fn test_images_by_destination() {
    let request = Request::get(url("http://localhost:5000/static/icons/icon-512x512.png"))
      .with_destination(Destination::Image);
    assert_eq!(
      strategy(&request),
      Strategy::CacheFirstRevalidate(StoreKind::Image)
    );
  }

  #[test]
  fn test_same_origin_static_is_stale_while_revalidate() {
    let request = Request::get(url("http://localhost:5000/static/css/style.css"))
      .with_destination(Destination::Style);
    assert_eq!(
      strategy(&request),
      Strategy::StaleWhileRevalidate(StoreKind::Runtime)
    );
  }

  #[test]
  fn test_cross_origin_get_is_network_only() {
    let request = Request::get(url("https://abc.supabase.co/rest/v1/blacklist?select=*"));
    assert_eq!(strategy(&request), Strategy::NetworkOnly);
  }
}
