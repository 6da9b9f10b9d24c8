//! Capture-time stamping and TTL evaluation.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

use crate::classifier::ResourceCategory;
use crate::config::TtlConfig;

use super::entry::{CachedResponse, Entry, EntryKey};
use super::lock::mutex_lock;

/// Source of the current time.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(start),
    }
  }

  pub fn advance(&self, by: Duration) {
    let mut now = mutex_lock(&self.now, "cache::freshness", "advance");
    *now += by;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *mutex_lock(&self.now, "cache::freshness", "now")
  }
}

/// Upper bound for configured TTLs (ten years).
const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// The canonical TTL table.
#[derive(Debug, Clone, Copy)]
pub struct TtlPolicy {
  pub static_asset: Duration,
  pub image: Duration,
  pub cacheable_api: Duration,
  pub fallback: Duration,
}

impl TtlPolicy {
  /// TTL for a category. Network-first and default entries have none.
  pub fn for_category(&self, category: ResourceCategory) -> Option<Duration> {
    match category {
      ResourceCategory::StaticAsset => Some(self.static_asset),
      ResourceCategory::Image => Some(self.image),
      ResourceCategory::CacheableApi => Some(self.cacheable_api),
      ResourceCategory::NetworkFirstApi | ResourceCategory::Default => None,
    }
  }
}

impl Default for TtlPolicy {
  fn default() -> Self {
    Self::from(&TtlConfig::default())
  }
}

impl From<&TtlConfig> for TtlPolicy {
  fn from(config: &TtlConfig) -> Self {
    let secs = |s: u64| Duration::seconds(s.min(MAX_TTL_SECS) as i64);
    Self {
      static_asset: secs(config.static_asset_secs),
      image: secs(config.image_secs),
      cacheable_api: secs(config.cacheable_api_secs),
      fallback: secs(config.fallback_secs),
    }
  }
}

/// Stamps captured responses and judges their age.
#[derive(Clone)]
pub struct FreshnessTracker {
  clock: Arc<dyn Clock>,
  policy: TtlPolicy,
}

impl FreshnessTracker {
  pub fn new(clock: Arc<dyn Clock>, policy: TtlPolicy) -> Self {
    Self { clock, policy }
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  pub fn policy(&self) -> &TtlPolicy {
    &self.policy
  }

  /// Turn an origin response into an entry captured now.
  pub fn stamp(
    &self,
    key: EntryKey,
    response: CachedResponse,
    category: ResourceCategory,
  ) -> Entry {
    Entry {
      key,
      response,
      captured_at: self.now(),
      category,
    }
  }

  pub fn age(&self, entry: &Entry) -> Duration {
    self.now() - entry.captured_at
  }

  pub fn is_fresh(&self, entry: &Entry, ttl: Duration) -> bool {
    self.age(entry) < ttl
  }

  /// Freshness against the entry's own category TTL; categories without one are never fresh.
  pub fn is_fresh_for_category(&self, entry: &Entry) -> bool {
    self
      .policy
      .for_category(entry.category)
      .is_some_and(|ttl| self.is_fresh(entry, ttl))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn tracker() -> (Arc<ManualClock>, FreshnessTracker) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let tracker = FreshnessTracker::new(clock.clone(), TtlPolicy::default());
    (clock, tracker)
  }

  fn entry(tracker: &FreshnessTracker, category: ResourceCategory) -> Entry {
    let key = EntryKey::new("GET", &Url::parse("http://o/api/flights").unwrap());
    tracker.stamp(key, CachedResponse::new(200, vec![], "[]"), category)
  }

  #[test]
  fn test_stamp_uses_clock() {
    let (clock, tracker) = tracker();
    let e = entry(&tracker, ResourceCategory::CacheableApi);
    assert_eq!(e.captured_at, clock.now());
  }

  #[test]
  fn test_api_entry_goes_stale_at_ttl_boundary() {
    let (clock, tracker) = tracker();
    let e = entry(&tracker, ResourceCategory::CacheableApi);

    clock.advance(Duration::minutes(29) + Duration::seconds(59));
    assert!(tracker.is_fresh_for_category(&e));

    clock.advance(Duration::seconds(1));
    assert!(!tracker.is_fresh_for_category(&e));
  }

  #[test]
  fn test_categories_without_ttl_are_never_fresh() {
    let (_clock, tracker) = tracker();
    let e = entry(&tracker, ResourceCategory::NetworkFirstApi);
    assert!(!tracker.is_fresh_for_category(&e));
  }

  #[test]
  fn test_canonical_ttl_table() {
    let policy = TtlPolicy::default();
    assert_eq!(
      policy.for_category(ResourceCategory::StaticAsset),
      Some(Duration::days(7))
    );
    assert_eq!(
      policy.for_category(ResourceCategory::Image),
      Some(Duration::hours(24))
    );
    assert_eq!(
      policy.for_category(ResourceCategory::CacheableApi),
      Some(Duration::minutes(30))
    );
    assert_eq!(policy.fallback, Duration::hours(1));
  }
}
