//! The caching algorithms, one per resource category.
//!
//! Every strategy makes at most one synchronous origin call per request and
//! always produces a response: cached data, the origin's answer, or a typed
//! fallback. Only NetworkFirst lets an error escape, and only when nothing is
//! cached at all.

mod fallback;
mod revalidate;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};
use url::Url;

use crate::cache::{
  CacheManager, CachedResponse, Entry, FreshnessTracker, Partition, Purpose, Served,
};
use crate::classifier::{Classifier, ResourceCategory};
use crate::error::{CacheError, CacheResult};
use crate::origin::Origin;
use crate::request::InterceptedRequest;

pub use fallback::Fallbacks;
pub use revalidate::Revalidator;

/// Which algorithm serves a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
  TtlGated,
  Image,
}

impl Strategy {
  pub fn for_category(category: ResourceCategory) -> Self {
    match category {
      ResourceCategory::StaticAsset => Self::CacheFirst,
      ResourceCategory::NetworkFirstApi => Self::NetworkFirst,
      ResourceCategory::Default => Self::StaleWhileRevalidate,
      ResourceCategory::CacheableApi => Self::TtlGated,
      ResourceCategory::Image => Self::Image,
    }
  }
}

/// Send a request to the origin with a deadline. Any HTTP status is `Ok`.
pub(crate) async fn fetch_raw(
  origin: &dyn Origin,
  request: &InterceptedRequest,
  timeout: Duration,
) -> CacheResult<CachedResponse> {
  match tokio::time::timeout(timeout, origin.fetch(request)).await {
    Ok(result) => result,
    Err(_) => Err(CacheError::network(request.url.as_str(), "timed out")),
  }
}

/// Like `fetch_raw`, but a non-2xx answer is an `OriginError`.
pub(crate) async fn fetch_origin(
  origin: &dyn Origin,
  request: &InterceptedRequest,
  timeout: Duration,
) -> CacheResult<CachedResponse> {
  let response = fetch_raw(origin, request, timeout).await?;
  if response.is_success() {
    Ok(response)
  } else {
    Err(CacheError::OriginError {
      url: request.url.to_string(),
      status: response.status,
      response: Box::new(response),
    })
  }
}

/// Whether a successful origin response may be written to a partition.
pub(crate) fn is_storable(response: &CachedResponse, category: ResourceCategory) -> bool {
  if !response.is_success() || response.forbids_storage() {
    return false;
  }
  match category {
    ResourceCategory::Image => response.is_image(),
    _ => true,
  }
}

#[derive(Clone)]
pub struct StrategyEngine {
  manager: CacheManager,
  freshness: FreshnessTracker,
  classifier: Arc<Classifier>,
  origin: Arc<dyn Origin>,
  revalidator: Revalidator,
  fallbacks: Fallbacks,
  timeout: Duration,
}

impl StrategyEngine {
  pub fn new(
    manager: CacheManager,
    freshness: FreshnessTracker,
    classifier: Arc<Classifier>,
    origin: Arc<dyn Origin>,
    timeout: Duration,
    offline_page: Option<Url>,
  ) -> Self {
    let revalidator = Revalidator::new(
      Arc::clone(&origin),
      manager.clone(),
      freshness.clone(),
      timeout,
    );
    let fallbacks = Fallbacks::new(
      manager.clone(),
      freshness.clone(),
      revalidator.clone(),
      offline_page,
    );

    Self {
      manager,
      freshness,
      classifier,
      origin,
      revalidator,
      fallbacks,
      timeout,
    }
  }

  pub fn manager(&self) -> &CacheManager {
    &self.manager
  }

  pub fn classify(&self, request: &InterceptedRequest) -> ResourceCategory {
    self.classifier.classify(request)
  }

  /// Serve one intercepted GET request.
  #[instrument(skip_all, fields(url = %request.url))]
  pub async fn handle(&self, request: &InterceptedRequest) -> CacheResult<Served> {
    let category = self.classify(request);

    if request.only_if_cached() {
      return self.cached_only(request, category);
    }

    let strategy = Strategy::for_category(category);
    debug!(?strategy, %category, "dispatching request");

    match strategy {
      Strategy::CacheFirst => self.cache_first(request, category).await,
      Strategy::NetworkFirst => self.network_first(request, category).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request, category).await,
      Strategy::TtlGated => self.ttl_gated(request, category).await,
      Strategy::Image => self.image(request, category).await,
    }
  }

  /// Forward a non-GET request untouched.
  pub async fn pass_through(&self, request: &InterceptedRequest) -> CacheResult<CachedResponse> {
    fetch_raw(self.origin.as_ref(), request, self.timeout).await
  }

  /// Fetch `request` and store it in its category's partition.
  pub async fn precache(&self, request: &InterceptedRequest) -> CacheResult<Partition> {
    let category = self.classify(request);
    let partition = self.manager.partition_for(category);
    self.precache_into(request, &partition, category).await?;
    Ok(partition)
  }

  /// Fetch the configured offline page into the fallback partition.
  pub async fn precache_offline_page(&self) -> CacheResult<Option<Partition>> {
    let Some(url) = self.fallbacks.offline_page().cloned() else {
      return Ok(None);
    };
    let partition = self.manager.partition(Purpose::Fallback);
    self
      .precache_into(
        &InterceptedRequest::get(url),
        &partition,
        ResourceCategory::Default,
      )
      .await?;
    Ok(Some(partition))
  }

  async fn precache_into(
    &self,
    request: &InterceptedRequest,
    partition: &Partition,
    category: ResourceCategory,
  ) -> CacheResult<()> {
    let response = fetch_origin(self.origin.as_ref(), request, self.timeout).await?;
    if !is_storable(&response, category) {
      return Err(CacheError::Storage(format!(
        "{} is not storable as {}",
        request.url, category
      )));
    }
    let entry = self.freshness.stamp(request.key(), response, category);
    self.manager.put(partition, &entry)
  }

  // ===========================================================================
  // Algorithms
  // ===========================================================================

  async fn cache_first(
    &self,
    request: &InterceptedRequest,
    category: ResourceCategory,
  ) -> CacheResult<Served> {
    let partition = self.manager.partition_for(category);

    if let Some(entry) = self.lookup(&partition, request) {
      self.revalidator.schedule(request, &partition, category);
      let fresh = self.freshness.is_fresh_for_category(&entry);
      return Ok(Served::from_cache(entry, fresh));
    }

    self.fetch_and_store(request, &partition, category, None).await
  }

  async fn network_first(
    &self,
    request: &InterceptedRequest,
    category: ResourceCategory,
  ) -> CacheResult<Served> {
    let partition = self.manager.partition_for(category);

    match fetch_origin(self.origin.as_ref(), request, self.timeout).await {
      Ok(response) => {
        self.store(request, &partition, category, &response);
        Ok(Served::from_network(response, category))
      }
      Err(e) if e.is_fetch_failure() => match self.lookup(&partition, request) {
        Some(entry) => {
          debug!(error = %e, "origin failed, serving cached copy");
          Ok(Served::offline(entry))
        }
        None => Err(e),
      },
      Err(e) => Err(e),
    }
  }

  async fn stale_while_revalidate(
    &self,
    request: &InterceptedRequest,
    category: ResourceCategory,
  ) -> CacheResult<Served> {
    let partition = self.manager.partition_for(category);

    if let Some(entry) = self.lookup(&partition, request) {
      self.revalidator.schedule(request, &partition, category);
      return Ok(Served::from_cache(entry, false));
    }

    self.fetch_and_store(request, &partition, category, None).await
  }

  async fn ttl_gated(
    &self,
    request: &InterceptedRequest,
    category: ResourceCategory,
  ) -> CacheResult<Served> {
    let partition = self.manager.partition_for(category);
    let cached = self.lookup(&partition, request);

    if let Some(entry) = &cached {
      if self.freshness.is_fresh_for_category(entry) {
        debug!(age = %self.freshness.age(entry), "fresh hit");
        return Ok(Served::from_cache(entry.clone(), true));
      }
    }

    self.fetch_and_store(request, &partition, category, cached).await
  }

  async fn image(
    &self,
    request: &InterceptedRequest,
    category: ResourceCategory,
  ) -> CacheResult<Served> {
    let partition = self.manager.partition_for(category);

    if let Some(entry) = self.lookup(&partition, request) {
      let fresh = self.freshness.is_fresh_for_category(&entry);
      if !fresh {
        self.revalidator.schedule(request, &partition, category);
      }
      return Ok(Served::from_cache(entry, fresh));
    }

    self.fetch_and_store(request, &partition, category, None).await
  }

  /// Serve from cache without touching the network.
  fn cached_only(
    &self,
    request: &InterceptedRequest,
    category: ResourceCategory,
  ) -> CacheResult<Served> {
    let partition = self.manager.partition_for(category);
    let entry = self.manager.require(&partition, &request.key())?;
    let fresh = self.freshness.is_fresh_for_category(&entry);
    Ok(Served::from_cache(entry, fresh))
  }

  // ===========================================================================
  // Helpers
  // ===========================================================================

  /// Fetch, store on success, and absorb failures into `stale` or a fallback.
  async fn fetch_and_store(
    &self,
    request: &InterceptedRequest,
    partition: &Partition,
    category: ResourceCategory,
    stale: Option<Entry>,
  ) -> CacheResult<Served> {
    match fetch_origin(self.origin.as_ref(), request, self.timeout).await {
      Ok(response) => {
        self.store(request, partition, category, &response);
        Ok(Served::from_network(response, category))
      }
      Err(e) => match stale {
        Some(entry) if e.is_fetch_failure() => {
          debug!(error = %e, "origin failed, serving stale entry");
          Ok(Served::offline(entry))
        }
        _ => self.recover(request, category, e),
      },
    }
  }

  /// Terminal path when nothing is cached.
  fn recover(
    &self,
    request: &InterceptedRequest,
    category: ResourceCategory,
    error: CacheError,
  ) -> CacheResult<Served> {
    match error {
      CacheError::OriginError { response, .. } => Ok(Served::from_network(*response, category)),
      CacheError::NetworkUnavailable { ref reason, .. } => {
        warn!(reason = %reason, %category, "origin unreachable and nothing cached, serving fallback");
        Ok(self.fallbacks.respond(request, category))
      }
      other => Err(other),
    }
  }

  /// Cache lookup where a storage failure counts as a miss.
  fn lookup(&self, partition: &Partition, request: &InterceptedRequest) -> Option<Entry> {
    match self.manager.get(partition, &request.key()) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(partition = %partition, error = %e, "cache lookup failed, treating as miss");
        None
      }
    }
  }

  fn store(
    &self,
    request: &InterceptedRequest,
    partition: &Partition,
    category: ResourceCategory,
    response: &CachedResponse,
  ) {
    if !is_storable(response, category) {
      debug!(status = response.status, "response not storable, skipping cache");
      return;
    }
    let entry = self.freshness.stamp(request.key(), response.clone(), category);
    if let Err(e) = self.manager.put(partition, &entry) {
      warn!(partition = %partition, error = %e, "cache write failed");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, Clock, ManualClock, MemoryStorage, TtlPolicy};
  use crate::config::ClassifierConfig;
  use crate::origin::testing::MockOrigin;
  use axum::http::header;
  use chrono::Utc;

  struct Fixture {
    clock: Arc<ManualClock>,
    origin: Arc<MockOrigin>,
    manager: CacheManager,
    engine: StrategyEngine,
  }

  fn fixture() -> Fixture {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let origin = Arc::new(MockOrigin::new());
    let manager = CacheManager::new(Arc::new(MemoryStorage::new()), "v1");
    let engine = StrategyEngine::new(
      manager.clone(),
      FreshnessTracker::new(clock.clone(), TtlPolicy::default()),
      Arc::new(Classifier::new(&ClassifierConfig::default()).unwrap()),
      origin.clone(),
      Duration::from_secs(1),
      Some(Url::parse("http://o/offline.html").unwrap()),
    );
    Fixture {
      clock,
      origin,
      manager,
      engine,
    }
  }

  fn get(url: &str) -> InterceptedRequest {
    InterceptedRequest::get(Url::parse(url).unwrap())
  }

  fn minutes(n: i64) -> chrono::Duration {
    chrono::Duration::minutes(n)
  }

  /// Let detached revalidations run to completion.
  async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
  }

  #[test]
  fn test_strategy_table() {
    assert_eq!(
      Strategy::for_category(ResourceCategory::StaticAsset),
      Strategy::CacheFirst
    );
    assert_eq!(
      Strategy::for_category(ResourceCategory::CacheableApi),
      Strategy::TtlGated
    );
    assert_eq!(
      Strategy::for_category(ResourceCategory::Default),
      Strategy::StaleWhileRevalidate
    );
  }

  #[test]
  fn test_is_storable() {
    let ok = CachedResponse::new(200, vec![], "x");
    assert!(is_storable(&ok, ResourceCategory::Default));
    assert!(!is_storable(&ok, ResourceCategory::Image));

    let no_store = CachedResponse::new(
      200,
      vec![("Cache-Control".into(), "private, no-store".into())],
      "x",
    );
    assert!(!is_storable(&no_store, ResourceCategory::Default));
    assert!(!is_storable(
      &CachedResponse::new(500, vec![], "x"),
      ResourceCategory::Default
    ));
  }

  #[tokio::test]
  async fn test_flights_scenario_respects_thirty_minute_ttl() {
    let f = fixture();
    f.origin
      .json("http://o/api/flights?airport=JAC", r#"[{"flight":"UA 123"}]"#);
    let req = get("http://o/api/flights?airport=JAC");

    let first = f.engine.handle(&req).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(f.origin.calls(), 1);

    let entry = f
      .manager
      .get(&f.manager.partition(Purpose::Api), &req.key())
      .unwrap()
      .unwrap();
    assert_eq!(entry.category, ResourceCategory::CacheableApi);
    assert_eq!(entry.captured_at, f.clock.now());

    f.clock.advance(minutes(5));
    let second = f.engine.handle(&req).await.unwrap();
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(second.response.body, first.response.body);
    assert_eq!(f.origin.calls(), 1);

    f.clock.advance(minutes(26));
    let third = f.engine.handle(&req).await.unwrap();
    assert_eq!(third.source, CacheSource::Network);
    assert_eq!(f.origin.calls(), 2);
  }

  #[tokio::test]
  async fn test_ttl_boundary_refetches_exactly_at_expiry() {
    let f = fixture();
    f.origin.json("http://o/api/weather", "{}");
    let req = get("http://o/api/weather");

    f.engine.handle(&req).await.unwrap();
    f.clock.advance(minutes(30) - chrono::Duration::milliseconds(1));
    f.engine.handle(&req).await.unwrap();
    assert_eq!(f.origin.calls(), 1);

    f.clock.advance(chrono::Duration::milliseconds(1));
    f.engine.handle(&req).await.unwrap();
    assert_eq!(f.origin.calls(), 2);
  }

  #[tokio::test]
  async fn test_stale_api_entry_served_when_offline() {
    let f = fixture();
    f.origin.json("http://o/api/flights", "[1]");
    let req = get("http://o/api/flights");
    f.engine.handle(&req).await.unwrap();

    f.clock.advance(minutes(45));
    f.origin.set_offline(true);

    let served = f.engine.handle(&req).await.unwrap();
    assert_eq!(served.source, CacheSource::Offline);
    assert_eq!(served.response.body.as_ref(), b"[1]");
  }

  #[tokio::test]
  async fn test_no_entry_and_offline_serves_typed_fallback() {
    let f = fixture();
    f.origin.set_offline(true);

    let api = f.engine.handle(&get("http://o/api/flights")).await.unwrap();
    assert_eq!(api.source, CacheSource::Fallback);
    assert_eq!(api.response.status, 503);
    assert_eq!(api.response.content_type(), Some("application/json"));

    let page = f
      .engine
      .handle(&get("http://o/flights").with_header(header::ACCEPT, "text/html"))
      .await
      .unwrap();
    assert_eq!(page.source, CacheSource::Fallback);

    let img = f.engine.handle(&get("http://o/photos/a.png")).await.unwrap();
    assert!(img.response.is_image());
  }

  #[tokio::test]
  async fn test_warm_static_hit_makes_no_synchronous_call() {
    let f = fixture();
    f.origin.route(
      "http://o/static/app.js",
      CachedResponse::new(200, vec![], "console.log(1)"),
    );
    let req = get("http://o/static/app.js");
    f.engine.handle(&req).await.unwrap();
    settle().await;

    f.origin.set_offline(true);
    f.origin.set_delay(Duration::from_secs(5));
    let started = std::time::Instant::now();
    let served = f.engine.handle(&req).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(served.source.is_cached());
    assert_eq!(served.response.body.as_ref(), b"console.log(1)");
  }

  #[tokio::test]
  async fn test_network_first_prefers_origin_then_cache() {
    let f = fixture();
    f.origin.json("http://o/api/runs", r#"["a"]"#);
    let req = get("http://o/api/runs");

    let live = f.engine.handle(&req).await.unwrap();
    assert_eq!(live.source, CacheSource::Network);

    f.origin.json("http://o/api/runs", r#"["b"]"#);
    let live = f.engine.handle(&req).await.unwrap();
    assert_eq!(live.response.body.as_ref(), br#"["b"]"#);

    f.origin.set_offline(true);
    let cached = f.engine.handle(&req).await.unwrap();
    assert_eq!(cached.source, CacheSource::Offline);
    assert_eq!(cached.response.body.as_ref(), br#"["b"]"#);
  }

  #[tokio::test]
  async fn test_network_first_without_cache_propagates() {
    let f = fixture();
    f.origin.set_offline(true);
    let err = f
      .engine
      .handle(&get("http://o/api/preferences"))
      .await
      .unwrap_err();
    assert!(matches!(err, CacheError::NetworkUnavailable { .. }));
  }

  #[tokio::test]
  async fn test_swr_serves_cache_and_refreshes_in_background() {
    let f = fixture();
    f.origin
      .route("http://o/runs/7", CachedResponse::new(200, vec![], "old"));
    let req = get("http://o/runs/7");
    f.engine.handle(&req).await.unwrap();

    f.origin
      .route("http://o/runs/7", CachedResponse::new(200, vec![], "new"));
    let served = f.engine.handle(&req).await.unwrap();
    assert_eq!(served.source, CacheSource::CacheStale);
    assert_eq!(served.response.body.as_ref(), b"old");

    settle().await;
    let served = f.engine.handle(&req).await.unwrap();
    assert_eq!(served.response.body.as_ref(), b"new");
  }

  #[tokio::test]
  async fn test_image_strategy_stores_only_images() {
    let f = fixture();
    f.origin.route(
      "http://o/photos/a.png",
      CachedResponse::new(200, vec![("content-type".into(), "text/html".into())], "<p>"),
    );
    f.engine.handle(&get("http://o/photos/a.png")).await.unwrap();
    assert_eq!(f.manager.entry_count("images-v1").unwrap(), 0);

    f.origin.route(
      "http://o/photos/b.png",
      CachedResponse::new(200, vec![("content-type".into(), "image/png".into())], "PNG"),
    );
    f.engine.handle(&get("http://o/photos/b.png")).await.unwrap();
    assert_eq!(f.manager.entry_count("images-v1").unwrap(), 1);

    // a fresh image hit does not touch the origin, even in the background
    f.engine.handle(&get("http://o/photos/b.png")).await.unwrap();
    settle().await;
    assert_eq!(f.origin.calls(), 2);
  }

  #[tokio::test]
  async fn test_origin_error_without_cache_is_relayed() {
    let f = fixture();
    let served = f.engine.handle(&get("http://o/missing")).await.unwrap();
    assert_eq!(served.response.status, 404);
    assert_eq!(f.manager.entry_count("runtime-v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_only_if_cached_never_hits_network() {
    let f = fixture();
    let req = get("http://o/api/flights").with_header(header::CACHE_CONTROL, "only-if-cached");
    let err = f.engine.handle(&req).await.unwrap_err();
    assert!(matches!(err, CacheError::CacheMiss { .. }));
    assert_eq!(f.origin.calls(), 0);
  }

  #[tokio::test]
  async fn test_origin_timeout_is_network_failure() {
    let f = fixture();
    f.origin.set_delay(Duration::from_secs(5));
    let err = fetch_origin(f.origin.as_ref(), &get("http://o/slow"), Duration::from_millis(10))
      .await
      .unwrap_err();
    assert!(matches!(err, CacheError::NetworkUnavailable { .. }));
  }

  #[tokio::test]
  async fn test_precache_offline_page_goes_to_fallback_partition() {
    let f = fixture();
    f.origin.route(
      "http://o/offline.html",
      CachedResponse::new(200, vec![], "<p>offline</p>"),
    );
    let partition = f.engine.precache_offline_page().await.unwrap().unwrap();
    assert_eq!(partition.name, "fallback-v1");
    assert_eq!(f.manager.entry_count("fallback-v1").unwrap(), 1);
  }
}
