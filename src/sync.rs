//! Invalidation of volatile data when connectivity comes back.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheManager;
use crate::error::CacheResult;
use crate::event::{DispatchHandle, Event};
use crate::origin::Origin;
use crate::request::InterceptedRequest;
use crate::strategy::fetch_raw;

/// Drops API partitions so the next reads go back to the origin.
#[derive(Clone)]
pub struct SyncTrigger {
  manager: CacheManager,
}

impl SyncTrigger {
  pub fn new(manager: CacheManager) -> Self {
    Self { manager }
  }

  /// Purge every volatile partition. Returns the purged names.
  pub fn connectivity_restored(&self) -> CacheResult<Vec<String>> {
    let mut purged = Vec::new();
    for partition in self.manager.partitions()? {
      if !partition.purpose.is_volatile() {
        continue;
      }
      if self.manager.purge(&partition.name)? {
        purged.push(partition.name);
      }
    }
    info!(purged = purged.len(), "connectivity restored, volatile partitions purged");
    Ok(purged)
  }
}

/// Probes the origin and signals offline to online transitions.
pub struct ConnectivityMonitor {
  origin: Arc<dyn Origin>,
  probe: Url,
  timeout: Duration,
  online: bool,
}

impl ConnectivityMonitor {
  pub fn new(origin: Arc<dyn Origin>, probe: Url, timeout: Duration) -> Self {
    Self {
      origin,
      probe,
      timeout,
      // assume online so startup does not purge anything
      online: true,
    }
  }

  /// Any HTTP answer counts as reachable.
  pub async fn probe(&self) -> bool {
    let request = InterceptedRequest::get(self.probe.clone());
    match fetch_raw(self.origin.as_ref(), &request, self.timeout).await {
      Ok(_) => true,
      Err(e) => {
        debug!(error = %e, "connectivity probe failed");
        false
      }
    }
  }

  /// Record a probe result. True when it is an offline to online transition.
  pub fn observe(&mut self, online: bool) -> bool {
    let restored = online && !self.online;
    if online != self.online {
      if online {
        info!(probe = %self.probe, "origin reachable again");
      } else {
        warn!(probe = %self.probe, "origin unreachable");
      }
    }
    self.online = online;
    restored
  }

  /// Probe every `interval` until the dispatcher goes away.
  pub fn spawn(mut self, interval: Duration, dispatch: DispatchHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        if dispatch.is_closed() {
          break;
        }
        let online = self.probe().await;
        if self.observe(online) {
          if let Err(e) = dispatch.dispatch(Event::Online).await {
            debug!(error = %e, "stopping connectivity monitor");
            break;
          }
        }
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CachedResponse, Entry, EntryKey, MemoryStorage, Purpose};
  use crate::classifier::ResourceCategory;
  use crate::origin::testing::MockOrigin;
  use chrono::Utc;

  fn seed(manager: &CacheManager, purpose: Purpose) {
    let category = purpose.category().unwrap_or(ResourceCategory::Default);
    let entry = Entry {
      key: EntryKey::new("GET", &Url::parse("http://o/x").unwrap()),
      response: CachedResponse::new(200, vec![], "x"),
      captured_at: Utc::now(),
      category,
    };
    manager.put(&manager.partition(purpose), &entry).unwrap();
  }

  #[test]
  fn test_only_volatile_partitions_are_purged() {
    let manager = CacheManager::new(Arc::new(MemoryStorage::new()), "v1");
    for purpose in Purpose::KNOWN {
      seed(&manager, purpose);
    }

    let mut purged = SyncTrigger::new(manager.clone())
      .connectivity_restored()
      .unwrap();
    purged.sort();
    assert_eq!(purged, vec!["api-v1".to_string(), "network-v1".to_string()]);

    let left = manager.list_partitions().unwrap();
    assert!(left.contains("static-v1"));
    assert!(left.contains("images-v1"));
    assert!(left.contains("runtime-v1"));
    assert!(left.contains("fallback-v1"));
    assert_eq!(manager.entry_count("static-v1").unwrap(), 1);
  }

  #[tokio::test]
  async fn test_monitor_reports_only_restorations() {
    let origin = Arc::new(MockOrigin::new());
    let mut monitor = ConnectivityMonitor::new(
      origin.clone(),
      Url::parse("http://o/").unwrap(),
      Duration::from_secs(1),
    );

    // 404 is still an answer
    assert!(monitor.probe().await);
    assert!(!monitor.observe(true));

    origin.set_offline(true);
    let online = monitor.probe().await;
    assert!(!online);
    assert!(!monitor.observe(online));

    origin.set_offline(false);
    let online = monitor.probe().await;
    assert!(monitor.observe(online));
    assert!(!monitor.observe(true));
  }
}
