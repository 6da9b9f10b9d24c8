//! The origin server: the thing behind a URL that returns an HTTP response.

use async_trait::async_trait;
use axum::http::{header, HeaderName};
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::cache::CachedResponse;
use crate::error::{CacheError, CacheResult};
use crate::request::InterceptedRequest;

/// Headers that describe a single hop and must not be forwarded.
fn hop_by_hop() -> [HeaderName; 7] {
  [
    header::CONNECTION,
    header::HOST,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
  ]
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
  hop_by_hop().contains(name)
}

#[async_trait]
pub trait Origin: Send + Sync {
  /// Send one request to the origin. Any HTTP answer, including non-2xx, is `Ok`;
  /// only transport failures are errors.
  async fn fetch(&self, request: &InterceptedRequest) -> CacheResult<CachedResponse>;
}

/// Origin reached over HTTP with reqwest.
#[derive(Clone)]
pub struct HttpOrigin {
  client: reqwest::Client,
  base: Url,
}

impl HttpOrigin {
  pub fn new(base: &str, timeout: Duration) -> Result<Self> {
    let base = Url::parse(base).map_err(|e| eyre!("Invalid origin URL '{}': {}", base, e))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, base })
  }

  pub fn base(&self) -> &Url {
    &self.base
  }

  /// Resolve a path (or absolute URL) against the origin.
  pub fn resolve(&self, path_or_url: &str) -> Result<Url> {
    self
      .base
      .join(path_or_url)
      .map_err(|e| eyre!("Invalid resource '{}': {}", path_or_url, e))
  }
}

#[async_trait]
impl Origin for HttpOrigin {
  async fn fetch(&self, request: &InterceptedRequest) -> CacheResult<CachedResponse> {
    let mut headers = request.headers.clone();
    for name in hop_by_hop() {
      headers.remove(&name);
    }

    let response = self
      .client
      .request(request.method.clone(), request.url.clone())
      .headers(headers)
      .body(request.body.clone())
      .send()
      .await
      .map_err(|e| CacheError::network(request.url.as_str(), describe(&e)))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter(|(name, _)| !is_hop_by_hop(name))
      .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| CacheError::network(request.url.as_str(), describe(&e)))?;

    debug!(url = %request.url, status, bytes = body.len(), "origin responded");

    Ok(CachedResponse {
      status,
      headers,
      body,
    })
  }
}

fn describe(e: &reqwest::Error) -> String {
  if e.is_timeout() {
    "timed out".to_string()
  } else if e.is_connect() {
    format!("connection failed: {e}")
  } else {
    e.to_string()
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_resolve_relative_and_absolute() {
    let origin = HttpOrigin::new("http://origin.test:3000/", Duration::from_secs(1)).unwrap();
    assert_eq!(
      origin.resolve("/api/flights?airport=JAC").unwrap().as_str(),
      "http://origin.test:3000/api/flights?airport=JAC"
    );
    assert_eq!(
      origin.resolve("https://api.weather.gov/points").unwrap().as_str(),
      "https://api.weather.gov/points"
    );
  }

  #[test]
  fn test_invalid_base_is_rejected() {
    assert!(HttpOrigin::new("not a url", Duration::from_secs(1)).is_err());
  }

  #[tokio::test]
  async fn test_unreachable_origin_is_network_unavailable() {
    let origin = HttpOrigin::new("http://127.0.0.1:9/", Duration::from_millis(500)).unwrap();
    let request = InterceptedRequest::get(origin.resolve("/api/flights").unwrap());
    let err = origin.fetch(&request).await.unwrap_err();
    assert!(matches!(err, CacheError::NetworkUnavailable { .. }));
  }
}
