use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;

use super::types::{Request, Response};
use super::Network;

/// Live network backed by reqwest.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("offline-sw/", env!("CARGO_PKG_VERSION")))
      .connect_timeout(Duration::from_secs(10))
      .timeout(Duration::from_secs(60))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(Response {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or_default().to_string(),
      headers,
      body: body.to_vec(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::Method;
  use url::Url;
  use wiremock::matchers::{body_string, header, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn url(server: &MockServer, path: &str) -> Url {
    Url::parse(&server.uri()).unwrap().join(path).unwrap()
  }

  #[tokio::test]
  async fn test_error_status_is_a_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/stats"))
      .respond_with(
        ResponseTemplate::new(500)
          .insert_header("x-trace", "abc")
          .set_body_string("boom"),
      )
      .mount(&server)
      .await;

    let network = HttpNetwork::new().unwrap();
    let response = network
      .fetch(&Request::get(url(&server, "/api/stats")))
      .await
      .unwrap();

    assert_eq!(response.status, 500);
    assert_eq!(response.status_text, "Internal Server Error");
    assert!(response
      .headers
      .iter()
      .any(|(name, value)| name == "x-trace" && value == "abc"));
    assert_eq!(response.body, b"boom".to_vec());
  }

  #[tokio::test]
  async fn test_sends_method_headers_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/submit"))
      .and(header("content-type", "application/json"))
      .and(body_string(r#"{"name":"x"}"#))
      .respond_with(ResponseTemplate::new(201).set_body_string("created"))
      .mount(&server)
      .await;

    let network = HttpNetwork::new().unwrap();
    let request = Request::new(Method::POST, url(&server, "/submit"))
      .with_header("Content-Type", "application/json")
      .with_body(r#"{"name":"x"}"#);
    let response = network.fetch(&request).await.unwrap();

    assert_eq!(response.status, 201);
    assert_eq!(response.status_text, "Created");
    assert_eq!(response.text(), "created");
  }

  #[tokio::test]
  async fn test_unreachable_host_is_an_error() {
    // Bind then release a port so nothing is listening on it
    let port = {
      let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
      listener.local_addr().unwrap().port()
    };
    let target = Url::parse(&format!("http://127.0.0.1:{}/", port)).unwrap();

    let network = HttpNetwork::new().unwrap();
    let err = network.fetch(&Request::get(target)).await.unwrap_err();
    assert!(err.to_string().starts_with("Failed to fetch"));
  }
}
