//! Core types stored in and served from cache partitions.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::classifier::ResourceCategory;

/// A response as captured from the origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
}

impl CachedResponse {
  pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      headers,
      body: body.into(),
    }
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn content_type(&self) -> Option<&str> {
    self.header("content-type")
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn is_image(&self) -> bool {
    self
      .content_type()
      .is_some_and(|ct| ct.trim().to_ascii_lowercase().starts_with("image/"))
  }

  /// Whether the origin asked for this response never to be stored.
  pub fn forbids_storage(&self) -> bool {
    self.header("cache-control").is_some_and(|cc| {
      cc.split(',')
        .any(|directive| directive.trim().eq_ignore_ascii_case("no-store"))
    })
  }
}

/// Composite cache key: method plus normalized URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryKey {
  pub method: String,
  pub url: String,
}

impl EntryKey {
  pub fn new(method: &str, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.to_ascii_uppercase(),
      url: url.to_string(),
    }
  }

  /// Stable, fixed-length key used by storage backends.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl std::fmt::Display for EntryKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// A stored response with its capture time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
  pub key: EntryKey,
  pub response: CachedResponse,
  pub captured_at: DateTime<Utc>,
  pub category: ResourceCategory,
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from the origin
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache past its TTL, or from a category without one
  CacheStale,
  /// Origin unavailable, serving cached data
  Offline,
  /// Nothing usable anywhere, serving a typed fallback
  Fallback,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::CacheFresh => "cache-fresh",
      Self::CacheStale => "cache-stale",
      Self::Offline => "offline",
      Self::Fallback => "fallback",
    }
  }

  pub fn is_cached(&self) -> bool {
    matches!(self, Self::CacheFresh | Self::CacheStale | Self::Offline)
  }
}

/// A response produced by the strategy engine, with metadata about the source.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: CachedResponse,
  pub source: CacheSource,
  pub category: ResourceCategory,
  /// When the data was captured (if from cache)
  pub captured_at: Option<DateTime<Utc>>,
}

impl Served {
  pub fn from_network(response: CachedResponse, category: ResourceCategory) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      category,
      captured_at: None,
    }
  }

  pub fn from_cache(entry: Entry, is_fresh: bool) -> Self {
    Self {
      response: entry.response,
      source: if is_fresh {
        CacheSource::CacheFresh
      } else {
        CacheSource::CacheStale
      },
      category: entry.category,
      captured_at: Some(entry.captured_at),
    }
  }

  pub fn offline(entry: Entry) -> Self {
    Self {
      response: entry.response,
      source: CacheSource::Offline,
      category: entry.category,
      captured_at: Some(entry.captured_at),
    }
  }

  pub fn fallback(response: CachedResponse, category: ResourceCategory) -> Self {
    Self {
      response,
      source: CacheSource::Fallback,
      category,
      captured_at: None,
    }
  }
}
