//! Typed responses for when neither the cache nor the origin can answer.

use tracing::debug;
use url::Url;

use crate::cache::{CacheManager, CachedResponse, EntryKey, FreshnessTracker, Purpose, Served};
use crate::classifier::ResourceCategory;
use crate::request::InterceptedRequest;

use super::revalidate::Revalidator;

const OFFLINE_STATUS: u16 = 503;

const OFFLINE_HTML: &str = "<!doctype html>\n<html lang=\"en\">\n<head><meta charset=\"utf-8\"><title>Offline</title></head>\n<body><h1>You are offline</h1><p>This page is not available offline yet. It will load once the connection is back.</p></body>\n</html>\n";

const PLACEHOLDER_SVG: &str = "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"64\" height=\"64\" viewBox=\"0 0 64 64\"><rect width=\"64\" height=\"64\" fill=\"#e5e7eb\"/></svg>";

#[derive(Clone)]
pub struct Fallbacks {
  manager: CacheManager,
  freshness: FreshnessTracker,
  revalidator: Revalidator,
  offline_page: Option<Url>,
}

impl Fallbacks {
  pub fn new(
    manager: CacheManager,
    freshness: FreshnessTracker,
    revalidator: Revalidator,
    offline_page: Option<Url>,
  ) -> Self {
    Self {
      manager,
      freshness,
      revalidator,
      offline_page,
    }
  }

  pub fn offline_page(&self) -> Option<&Url> {
    self.offline_page.as_ref()
  }

  /// Build the fallback for a request that could not be served.
  pub fn respond(&self, request: &InterceptedRequest, category: ResourceCategory) -> Served {
    let response = match category {
      ResourceCategory::Image => offline_response("image/svg+xml", PLACEHOLDER_SVG.to_string()),
      c if c.is_api() => offline_response("application/json", offline_json(request)),
      _ if request.is_navigation() || category == ResourceCategory::Default => {
        return self.offline_document(request, category);
      }
      _ => offline_response("text/plain; charset=utf-8", "offline".to_string()),
    };

    Served::fallback(response, category)
  }

  /// The precached offline page if there is one, else the built-in document.
  fn offline_document(&self, request: &InterceptedRequest, category: ResourceCategory) -> Served {
    if let Some(url) = &self.offline_page {
      let partition = self.manager.partition(Purpose::Fallback);
      let key = EntryKey::new("GET", url);

      if let Ok(Some(entry)) = self.manager.get(&partition, &key) {
        let ttl = self.freshness.policy().fallback;
        if !self.freshness.is_fresh(&entry, ttl) {
          debug!(url = %url, "offline page older than its TTL, refreshing");
          self.revalidator.schedule(
            &InterceptedRequest::get(url.clone()),
            &partition,
            ResourceCategory::Default,
          );
        }
        return Served::fallback(entry.response, category);
      }
    }

    debug!(url = %request.url, "no precached offline page, using built-in document");
    Served::fallback(
      offline_response("text/html; charset=utf-8", OFFLINE_HTML.to_string()),
      category,
    )
  }
}

fn offline_response(content_type: &str, body: String) -> CachedResponse {
  CachedResponse::new(
    OFFLINE_STATUS,
    vec![
      ("content-type".to_string(), content_type.to_string()),
      ("cache-control".to_string(), "no-store".to_string()),
    ],
    body,
  )
}

fn offline_json(request: &InterceptedRequest) -> String {
  serde_json::json!({
    "error": "offline",
    "message": "The server is unreachable and no cached copy is available.",
    "url": request.url.as_str(),
  })
  .to_string()
}
