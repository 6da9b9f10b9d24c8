//! Maps intercepted requests to the resource category that picks their caching strategy.

use color_eyre::{eyre::eyre, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::ClassifierConfig;
use crate::request::InterceptedRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceCategory {
  /// Scripts, styles, fonts and app shell files
  StaticAsset,
  Image,
  /// Critical read/write endpoints that must prefer live data
  NetworkFirstApi,
  /// Read endpoints that tolerate data up to a TTL old
  CacheableApi,
  /// Everything else, served stale-while-revalidate
  Default,
}

impl ResourceCategory {
  pub const ALL: [ResourceCategory; 5] = [
    Self::StaticAsset,
    Self::Image,
    Self::NetworkFirstApi,
    Self::CacheableApi,
    Self::Default,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::StaticAsset => "static_asset",
      Self::Image => "image",
      Self::NetworkFirstApi => "network_first_api",
      Self::CacheableApi => "cacheable_api",
      Self::Default => "default",
    }
  }

  /// Volatile categories are dropped when connectivity comes back.
  pub fn is_volatile(&self) -> bool {
    matches!(self, Self::NetworkFirstApi | Self::CacheableApi)
  }

  pub fn is_api(&self) -> bool {
    matches!(self, Self::NetworkFirstApi | Self::CacheableApi)
  }
}

impl fmt::Display for ResourceCategory {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl std::str::FromStr for ResourceCategory {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::ALL
      .into_iter()
      .find(|c| c.as_str() == s)
      .ok_or_else(|| format!("Invalid resource category: {s}"))
  }
}

/// Request classifier built from the configured allow-lists.
#[derive(Debug, Clone)]
pub struct Classifier {
  static_extensions: Vec<String>,
  static_prefixes: Vec<String>,
  static_paths: Vec<String>,
  network_first_prefixes: Vec<String>,
  cacheable_api: Vec<Regex>,
  image_extensions: Vec<String>,
}

impl Classifier {
  pub fn new(config: &ClassifierConfig) -> Result<Self> {
    let cacheable_api = config
      .cacheable_api_patterns
      .iter()
      .map(|p| Regex::new(p).map_err(|e| eyre!("Invalid cacheable API pattern '{}': {}", p, e)))
      .collect::<Result<Vec<_>>>()?;

    Ok(Self {
      static_extensions: lowercase(&config.static_extensions),
      static_prefixes: config.static_prefixes.clone(),
      static_paths: config.static_paths.clone(),
      network_first_prefixes: config.network_first_prefixes.clone(),
      cacheable_api,
      image_extensions: lowercase(&config.image_extensions),
    })
  }

  /// Classify a request. Precedence: static > network-first > cacheable API > image > default.
  pub fn classify(&self, request: &InterceptedRequest) -> ResourceCategory {
    let path = request.url.path();
    let extension = extension(path);

    if self.is_static(path, extension.as_deref()) {
      ResourceCategory::StaticAsset
    } else if self
      .network_first_prefixes
      .iter()
      .any(|p| path.starts_with(p.as_str()))
    {
      ResourceCategory::NetworkFirstApi
    } else if self
      .cacheable_api
      .iter()
      .any(|re| re.is_match(request.url.as_str()) || re.is_match(path))
    {
      ResourceCategory::CacheableApi
    } else if request.accept().is_some_and(|a| a.contains("image/"))
      || extension
        .as_deref()
        .is_some_and(|ext| self.image_extensions.iter().any(|e| e == ext))
    {
      ResourceCategory::Image
    } else {
      ResourceCategory::Default
    }
  }

  fn is_static(&self, path: &str, extension: Option<&str>) -> bool {
    self.static_paths.iter().any(|p| p == path)
      || self
        .static_prefixes
        .iter()
        .any(|p| path.starts_with(p.as_str()))
      || extension.is_some_and(|ext| self.static_extensions.iter().any(|e| e == ext))
  }
}

fn lowercase(items: &[String]) -> Vec<String> {
  items
    .iter()
    .map(|s| s.trim_start_matches('.').to_lowercase())
    .collect()
}

/// Lowercased extension of the last path segment, if any.
fn extension(path: &str) -> Option<String> {
  let segment = path.rsplit('/').next()?;
  let (stem, ext) = segment.rsplit_once('.')?;
  if stem.is_empty() || ext.is_empty() {
    return None;
  }
  Some(ext.to_lowercase())
}
