//! Install, activation and version cutover of agent instances.
//!
//! An instance is one version of the strategy engine. It is installed (which
//! precaches its resources), waits, and is activated either by an explicit
//! skip-waiting message or by natural takeover when nothing else is active.
//! Activation collects partitions that the new version does not own, claims
//! every known window and only then publishes the instance to new requests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{mutex_lock, rw_read, rw_write};
use crate::messaging::ClientRegistry;
use crate::request::InterceptedRequest;
use crate::strategy::StrategyEngine;

const SOURCE: &str = "lifecycle";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
  Installing,
  Waiting,
  Active,
  /// Replaced or superseded; never leaves this state
  Redundant,
}

impl InstanceState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Installing => "installing",
      Self::Waiting => "waiting",
      Self::Active => "active",
      Self::Redundant => "redundant",
    }
  }
}

/// One installed version of the agent.
pub struct Instance {
  version: String,
  engine: StrategyEngine,
  state: RwLock<InstanceState>,
}

impl Instance {
  fn new(engine: StrategyEngine) -> Self {
    Self {
      version: engine.manager().version().to_string(),
      engine,
      state: RwLock::new(InstanceState::Installing),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn engine(&self) -> &StrategyEngine {
    &self.engine
  }

  pub fn state(&self) -> InstanceState {
    *rw_read(&self.state, SOURCE, "state")
  }

  /// Move forward to `next`. Backward moves are ignored.
  fn transition(&self, next: InstanceState) -> bool {
    let mut state = rw_write(&self.state, SOURCE, "transition");
    if next <= *state {
      return false;
    }
    info!(version = %self.version, from = state.as_str(), to = next.as_str(), "lifecycle transition");
    *state = next;
    true
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivationReport {
  pub version: String,
  /// Partitions deleted because the new version does not own them
  pub removed: Vec<String>,
  /// Surviving partitions with their entry counts
  pub retained: BTreeMap<String, usize>,
  pub claimed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
  pub version: String,
  pub precached: usize,
  pub failed: Vec<String>,
  pub state: InstanceState,
}

pub struct LifecycleController {
  active: RwLock<Option<Arc<Instance>>>,
  waiting: Mutex<Option<Arc<Instance>>>,
  /// Serializes activations
  cutover: tokio::sync::Mutex<()>,
  clients: ClientRegistry,
  precache: Vec<Url>,
  skip_waiting: bool,
}

impl LifecycleController {
  pub fn new(clients: ClientRegistry, precache: Vec<Url>, skip_waiting: bool) -> Self {
    Self {
      active: RwLock::new(None),
      waiting: Mutex::new(None),
      cutover: tokio::sync::Mutex::new(()),
      clients,
      precache,
      skip_waiting,
    }
  }

  /// The instance new requests are routed to.
  pub fn active(&self) -> Option<Arc<Instance>> {
    rw_read(&self.active, SOURCE, "active").clone()
  }

  pub fn waiting(&self) -> Option<Arc<Instance>> {
    mutex_lock(&self.waiting, SOURCE, "waiting").clone()
  }

  /// Install a new version: precache, then wait (or take over straight away).
  pub async fn install(&self, engine: StrategyEngine) -> InstallReport {
    let instance = Arc::new(Instance::new(engine));
    info!(version = %instance.version, resources = self.precache.len(), "installing");

    let mut precached = 0;
    let mut failed = Vec::new();
    for url in &self.precache {
      match instance
        .engine
        .precache(&InterceptedRequest::get(url.clone()))
        .await
      {
        Ok(partition) => {
          debug!(url = %url, partition = %partition, "precached");
          precached += 1;
        }
        Err(e) => {
          warn!(url = %url, error = %e, "precache failed, continuing install");
          failed.push(url.to_string());
        }
      }
    }

    match instance.engine.precache_offline_page().await {
      Ok(Some(partition)) => debug!(partition = %partition, "offline page precached"),
      Ok(None) => {}
      Err(e) => warn!(error = %e, "offline page precache failed, continuing install"),
    }

    instance.transition(InstanceState::Waiting);
    let superseded = mutex_lock(&self.waiting, SOURCE, "install").replace(Arc::clone(&instance));
    if let Some(previous) = superseded {
      previous.transition(InstanceState::Redundant);
    }

    let takeover = self.skip_waiting || self.active().is_none();
    if takeover {
      self.activate().await;
    } else {
      info!(version = %instance.version, "installed, waiting for skip-waiting");
    }

    InstallReport {
      version: instance.version.clone(),
      precached,
      failed,
      state: instance.state(),
    }
  }

  /// Activate the waiting instance now. A no-op when nothing is waiting.
  pub async fn skip_waiting(&self) -> Option<ActivationReport> {
    self.activate().await
  }

  /// Collect, claim, then publish. Requests keep seeing the previous instance
  /// until the final swap.
  async fn activate(&self) -> Option<ActivationReport> {
    let _cutover = self.cutover.lock().await;
    let Some(instance) = mutex_lock(&self.waiting, SOURCE, "activate").take() else {
      debug!("skip-waiting with nothing waiting");
      return None;
    };

    let manager = instance.engine.manager();
    let allow = manager.allow_list();
    let mut removed = Vec::new();
    let mut retained = BTreeMap::new();

    match manager.list_partitions() {
      Ok(names) => {
        for name in names {
          if allow.contains(&name) {
            let count = manager.entry_count(&name).unwrap_or_default();
            retained.insert(name, count);
            continue;
          }
          match manager.retire(&name) {
            Ok(_) => {
              info!(partition = %name, "removed obsolete partition");
              removed.push(name);
            }
            Err(e) => warn!(partition = %name, error = %e, "failed to remove obsolete partition"),
          }
        }
      }
      Err(e) => warn!(error = %e, "could not enumerate partitions, skipping collection"),
    }

    let claimed = self.clients.claim(&instance.version);
    instance.transition(InstanceState::Active);
    let previous = rw_write(&self.active, SOURCE, "activate").replace(Arc::clone(&instance));
    if let Some(previous) = previous {
      previous.transition(InstanceState::Redundant);
    }

    info!(
      version = %instance.version,
      removed = removed.len(),
      retained = retained.len(),
      claimed,
      "activated"
    );

    Some(ActivationReport {
      version: instance.version.clone(),
      removed,
      retained,
      claimed,
    })
  }
}
