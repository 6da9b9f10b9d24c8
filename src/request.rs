use axum::http::{header, HeaderMap, Method};
use bytes::Bytes;
use url::Url;

use crate::cache::EntryKey;

/// A request intercepted on its way from a client to the origin.
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
  pub method: Method,
  pub url: Url,
  pub headers: HeaderMap,
  pub body: Bytes,
}

impl InterceptedRequest {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      headers: HeaderMap::new(),
      body: Bytes::new(),
    }
  }

  pub fn with_header(mut self, name: header::HeaderName, value: &str) -> Self {
    if let Ok(value) = value.parse() {
      self.headers.insert(name, value);
    }
    self
  }

  /// Only GET traffic is intercepted; everything else goes straight to the origin.
  pub fn is_cacheable_method(&self) -> bool {
    self.method == Method::GET
  }

  pub fn key(&self) -> EntryKey {
    EntryKey::new(self.method.as_str(), &self.url)
  }

  pub fn accept(&self) -> Option<&str> {
    self
      .headers
      .get(header::ACCEPT)
      .and_then(|v| v.to_str().ok())
  }

  pub fn only_if_cached(&self) -> bool {
    self
      .headers
      .get_all(header::CACHE_CONTROL)
      .iter()
      .filter_map(|v| v.to_str().ok())
      .flat_map(|v| v.split(','))
      .any(|d| d.trim().eq_ignore_ascii_case("only-if-cached"))
  }

  /// Whether the client is navigating to a document rather than loading a subresource.
  pub fn is_navigation(&self) -> bool {
    self.accept().is_some_and(|a| a.contains("text/html"))
  }
}
