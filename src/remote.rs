//! HTTP source standing in for the club backend.
//!
//! The accessor only needs "a function returning a future of T". This wraps a
//! JSON endpoint of the hosted backend in that shape for the CLI.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

/// How long a connectivity probe may take before we call it offline
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct RemoteSource {
  client: reqwest::Client,
  url: Url,
  token: Option<String>,
}

impl RemoteSource {
  pub fn new(url: &str, token: Option<String>) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid backend URL {}: {}", url, e))?;
    if url.host_str().is_none() {
      return Err(eyre!("Backend URL {} has no host", url));
    }

    let client = reqwest::Client::builder()
      .timeout(REQUEST_TIMEOUT)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, url, token })
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  /// GET the endpoint and decode the JSON body.
  pub async fn fetch_json(&self) -> Result<Value> {
    let mut request = self.client.get(self.url.clone());
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }

    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", self.url, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!("Backend returned {} for {}", status, self.url));
    }

    response
      .json::<Value>()
      .await
      .map_err(|e| eyre!("Failed to decode response from {}: {}", self.url, e))
  }

  /// Whether the backend host accepts TCP connections right now.
  pub async fn probe(&self) -> bool {
    let (Some(host), Some(port)) = (self.url.host_str(), self.url.port_or_known_default()) else {
      return false;
    };

    let reachable = matches!(
      tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect((host, port))).await,
      Ok(Ok(_))
    );
    debug!(host, port, reachable, "Probed backend");
    reachable
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::net::TcpListener;

  #[test]
  fn test_rejects_bad_urls() {
    assert!(RemoteSource::new("not a url", None).is_err());
    assert!(RemoteSource::new("mailto:club@example.com", None).is_err());
    assert!(RemoteSource::new("https://api.example.com/reservations", None).is_ok());
  }

  #[tokio::test]
  async fn test_probe_follows_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let source = RemoteSource::new(&format!("http://127.0.0.1:{}/data", port), None).unwrap();

    assert!(source.probe().await);

    drop(listener);
    assert!(!source.probe().await);
  }
}
