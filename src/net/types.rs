//! Request and response model shared by the worker, the caches and the queue.

use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::str::FromStr;
use url::Url;

/// How the request was initiated by the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
  /// Top-level page load
  Navigate,
  /// Subresource or script-initiated request
  #[default]
  Cors,
}

/// What the page intends to do with the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
  #[default]
  Empty,
  Document,
  Image,
  Font,
  Script,
  Style,
}

impl FromStr for Destination {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "" | "empty" => Ok(Destination::Empty),
      "document" => Ok(Destination::Document),
      "image" => Ok(Destination::Image),
      "font" => Ok(Destination::Font),
      "script" => Ok(Destination::Script),
      "style" => Ok(Destination::Style),
      other => Err(format!("unknown destination '{}'", other)),
    }
  }
}

#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
  pub mode: RequestMode,
  pub destination: Destination,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: None,
      mode: RequestMode::default(),
      destination: Destination::default(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn post(url: Url, body: impl Into<Vec<u8>>) -> Self {
    Self::new(Method::POST, url).with_body(body)
  }

  /// A page navigation, as issued by the browser for a top-level load.
  pub fn navigate(url: Url) -> Self {
    let mut request = Self::get(url);
    request.mode = RequestMode::Navigate;
    request.destination = Destination::Document;
    request
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  /// Cache identity of this request: method plus URL.
  pub fn cache_key(&self) -> String {
    format!("{} {}", self.method, self.url)
  }

  #[cfg(test)]
  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    let status_text = StatusCode::from_u16(status)
      .ok()
      .and_then(|s| s.canonical_reason())
      .unwrap_or_default()
      .to_string();

    Self {
      status,
      status_text,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// A JSON response with the given status.
  pub fn json(status: u16, value: &Value) -> Self {
    Self::new(status, value.to_string()).with_header("Content-Type", "application/json")
  }

  /// Plain 503 used whenever the worker has nothing better to serve.
  pub fn service_unavailable(message: &str) -> Self {
    Self::new(503, message).with_header("Content-Type", "text/plain; charset=utf-8")
  }

  /// True for 2xx statuses.
  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_status_text(mut self, status_text: &str) -> Self {
    self.status_text = status_text.to_string();
    self
  }

  #[cfg(test)]
  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  #[cfg(test)]
  pub fn json_body(&self) -> Option<Value> {
    serde_json::from_slice(&self.body).ok()
  }
}

#[cfg(test)]
fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(n, _)| n.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}
