//! Typed failures of the caching pipeline.

use thiserror::Error;

use crate::cache::CachedResponse;

/// Result alias for cache and origin operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Clone, Error)]
pub enum CacheError {
  /// The origin could not be reached, or the fetch timed out.
  #[error("network unavailable for {url}: {reason}")]
  NetworkUnavailable { url: String, reason: String },

  /// The origin answered with a non-2xx status.
  #[error("origin returned {status} for {url}")]
  OriginError {
    url: String,
    status: u16,
    response: Box<CachedResponse>,
  },

  /// Nothing is stored under the requested key.
  #[error("no cached entry for {key}")]
  CacheMiss { key: String },

  /// A stored entry could not be decoded.
  #[error("corrupt entry {key} in partition {partition}: {reason}")]
  PartitionCorrupt {
    partition: String,
    key: String,
    reason: String,
  },

  /// The storage backend itself failed.
  #[error("cache storage failure: {0}")]
  Storage(String),
}

impl CacheError {
  pub fn network(url: impl Into<String>, reason: impl ToString) -> Self {
    Self::NetworkUnavailable {
      url: url.into(),
      reason: reason.to_string(),
    }
  }

  /// True for the failures a strategy absorbs by serving cached data.
  pub fn is_fetch_failure(&self) -> bool {
    matches!(
      self,
      Self::NetworkUnavailable { .. } | Self::OriginError { .. }
    )
  }

  /// Short machine-readable label, used in logs and error bodies.
  pub fn kind(&self) -> &'static str {
    match self {
      Self::NetworkUnavailable { .. } => "network_unavailable",
      Self::OriginError { .. } => "origin_error",
      Self::CacheMiss { .. } => "cache_miss",
      Self::PartitionCorrupt { .. } => "partition_corrupt",
      Self::Storage(_) => "storage",
    }
  }
}

impl From<rusqlite::Error> for CacheError {
  fn from(e: rusqlite::Error) -> Self {
    Self::Storage(e.to_string())
  }
}
