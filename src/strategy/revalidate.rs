//! Detached, best-effort cache refreshes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::{mutex_lock, CacheManager, FreshnessTracker, Partition};
use crate::classifier::ResourceCategory;
use crate::origin::Origin;
use crate::request::InterceptedRequest;

use super::{fetch_origin, is_storable};

const SOURCE: &str = "strategy::revalidate";

type InFlight = Arc<Mutex<HashSet<(String, String)>>>;

/// Spawns refreshes that never block, and never fail, the request that triggered them.
#[derive(Clone)]
pub struct Revalidator {
  origin: Arc<dyn Origin>,
  manager: CacheManager,
  freshness: FreshnessTracker,
  timeout: Duration,
  in_flight: InFlight,
}

impl Revalidator {
  pub fn new(
    origin: Arc<dyn Origin>,
    manager: CacheManager,
    freshness: FreshnessTracker,
    timeout: Duration,
  ) -> Self {
    Self {
      origin,
      manager,
      freshness,
      timeout,
      in_flight: Arc::default(),
    }
  }

  /// Refresh `request` into `partition` in the background.
  ///
  /// Returns `None` when a refresh for the same key is already running.
  pub fn schedule(
    &self,
    request: &InterceptedRequest,
    partition: &Partition,
    category: ResourceCategory,
  ) -> Option<JoinHandle<()>> {
    let id = (partition.name.clone(), request.key().digest());
    if !mutex_lock(&self.in_flight, SOURCE, "schedule").insert(id.clone()) {
      debug!(url = %request.url, "revalidation already in flight");
      return None;
    }

    let guard = InFlightGuard {
      set: Arc::clone(&self.in_flight),
      id,
    };
    let this = self.clone();
    let request = request.clone();
    let partition = partition.clone();

    Some(tokio::spawn(async move {
      let _guard = guard;
      this.refresh(&request, &partition, category).await;
    }))
  }

  async fn refresh(
    &self,
    request: &InterceptedRequest,
    partition: &Partition,
    category: ResourceCategory,
  ) {
    let response = match fetch_origin(self.origin.as_ref(), request, self.timeout).await {
      Ok(response) => response,
      Err(e) => {
        warn!(url = %request.url, error = %e, "background revalidation failed");
        return;
      }
    };

    if !is_storable(&response, category) {
      debug!(url = %request.url, "revalidated response not storable, keeping cached entry");
      return;
    }

    let entry = self.freshness.stamp(request.key(), response, category);
    match self.manager.put(partition, &entry) {
      Ok(()) => debug!(url = %request.url, partition = %partition, "revalidated"),
      Err(e) => warn!(url = %request.url, error = %e, "failed to store revalidated response"),
    }
  }
}

/// Clears the in-flight marker even if the refresh task is cancelled.
struct InFlightGuard {
  set: InFlight,
  id: (String, String),
}

impl Drop for InFlightGuard {
  fn drop(&mut self) {
    mutex_lock(&self.set, SOURCE, "guard.drop").remove(&self.id);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ManualClock, MemoryStorage, Purpose, TtlPolicy};
  use crate::origin::testing::MockOrigin;
  use chrono::Utc;
  use url::Url;

  fn setup() -> (Arc<MockOrigin>, CacheManager, Revalidator) {
    let origin = Arc::new(MockOrigin::new());
    let manager = CacheManager::new(Arc::new(MemoryStorage::new()), "v1");
    let freshness = FreshnessTracker::new(
      Arc::new(ManualClock::new(Utc::now())),
      TtlPolicy::default(),
    );
    let revalidator = Revalidator::new(
      origin.clone(),
      manager.clone(),
      freshness,
      Duration::from_secs(1),
    );
    (origin, manager, revalidator)
  }

  fn request(url: &str) -> InterceptedRequest {
    InterceptedRequest::get(Url::parse(url).unwrap())
  }

  #[tokio::test]
  async fn test_refresh_stores_success() {
    let (origin, manager, revalidator) = setup();
    origin.json("http://o/api/flights", "[1]");
    let partition = manager.partition(Purpose::Api);
    let req = request("http://o/api/flights");

    revalidator
      .schedule(&req, &partition, ResourceCategory::CacheableApi)
      .unwrap()
      .await
      .unwrap();

    let entry = manager.get(&partition, &req.key()).unwrap().unwrap();
    assert_eq!(entry.response.body.as_ref(), b"[1]");
  }

  #[tokio::test]
  async fn test_failure_is_swallowed() {
    let (origin, manager, revalidator) = setup();
    origin.set_offline(true);
    let partition = manager.partition(Purpose::Static);

    let handle = revalidator
      .schedule(&request("http://o/app.js"), &partition, ResourceCategory::StaticAsset)
      .unwrap();

    assert!(handle.await.is_ok());
    assert_eq!(manager.entry_count("static-v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_concurrent_refreshes_are_coalesced() {
    let (origin, manager, revalidator) = setup();
    origin.set_delay(Duration::from_millis(50));
    origin.json("http://o/api/flights", "[]");
    let partition = manager.partition(Purpose::Api);
    let req = request("http://o/api/flights");

    let first = revalidator.schedule(&req, &partition, ResourceCategory::CacheableApi);
    let second = revalidator.schedule(&req, &partition, ResourceCategory::CacheableApi);
    assert!(first.is_some());
    assert!(second.is_none());

    first.unwrap().await.unwrap();
    assert_eq!(origin.calls(), 1);

    // once finished, the key can be refreshed again
    assert!(revalidator
      .schedule(&req, &partition, ResourceCategory::CacheableApi)
      .is_some());
  }
}
