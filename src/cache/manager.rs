//! Named, versioned cache partitions over a pluggable storage backend.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::classifier::ResourceCategory;
use crate::error::{CacheError, CacheResult};

use super::entry::{Entry, EntryKey};
use super::lock::{rw_read, rw_write};
use super::storage::CacheStorage;

/// What a partition holds; also selects the TTL policy that governs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
  Static,
  Images,
  /// TTL-gated API responses
  Api,
  /// Network-first API responses
  Network,
  /// Stale-while-revalidate runtime responses
  Runtime,
  /// Offline documents served when nothing else is available
  Fallback,
  /// A partition written by something we don't recognise
  Unknown,
}

impl Purpose {
  pub const KNOWN: [Purpose; 6] = [
    Self::Static,
    Self::Images,
    Self::Api,
    Self::Network,
    Self::Runtime,
    Self::Fallback,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Images => "images",
      Self::Api => "api",
      Self::Network => "network",
      Self::Runtime => "runtime",
      Self::Fallback => "fallback",
      Self::Unknown => "unknown",
    }
  }

  pub fn for_category(category: ResourceCategory) -> Self {
    match category {
      ResourceCategory::StaticAsset => Self::Static,
      ResourceCategory::Image => Self::Images,
      ResourceCategory::CacheableApi => Self::Api,
      ResourceCategory::NetworkFirstApi => Self::Network,
      ResourceCategory::Default => Self::Runtime,
    }
  }

  pub fn category(&self) -> Option<ResourceCategory> {
    match self {
      Self::Static => Some(ResourceCategory::StaticAsset),
      Self::Images => Some(ResourceCategory::Image),
      Self::Api => Some(ResourceCategory::CacheableApi),
      Self::Network => Some(ResourceCategory::NetworkFirstApi),
      Self::Runtime => Some(ResourceCategory::Default),
      Self::Fallback | Self::Unknown => None,
    }
  }

  pub fn is_volatile(&self) -> bool {
    self.category().is_some_and(|c| c.is_volatile())
  }
}

impl std::str::FromStr for Purpose {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::KNOWN
      .into_iter()
      .find(|p| p.as_str() == s)
      .ok_or_else(|| format!("Invalid partition purpose: {s}"))
  }
}

/// A named, versioned bucket of entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
  pub name: String,
  pub version: String,
  pub purpose: Purpose,
}

impl Partition {
  pub fn new(purpose: Purpose, version: &str) -> Self {
    Self {
      name: format!("{}-{}", purpose.as_str(), version),
      version: version.to_string(),
      purpose,
    }
  }
}

impl fmt::Display for Partition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.name)
  }
}

/// Entry point for partition operations, scoped to one schema version.
#[derive(Clone)]
pub struct CacheManager {
  storage: Arc<dyn CacheStorage>,
  version: String,
  /// Partitions collected at activation; shared by every version's manager
  retired: Arc<RwLock<BTreeSet<String>>>,
}

const SOURCE: &str = "cache_manager";

impl CacheManager {
  pub fn new(storage: Arc<dyn CacheStorage>, version: impl Into<String>) -> Self {
    Self {
      storage,
      version: version.into(),
      retired: Arc::default(),
    }
  }

  /// A manager for another version sharing the same storage.
  pub fn for_version(&self, version: impl Into<String>) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      version: version.into(),
      retired: Arc::clone(&self.retired),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn partition(&self, purpose: Purpose) -> Partition {
    Partition::new(purpose, &self.version)
  }

  pub fn partition_for(&self, category: ResourceCategory) -> Partition {
    self.partition(Purpose::for_category(category))
  }

  /// Names of every partition this version owns.
  pub fn allow_list(&self) -> BTreeSet<String> {
    Purpose::KNOWN
      .into_iter()
      .map(|p| self.partition(p).name)
      .collect()
  }

  /// Create the partition if needed. Idempotent.
  pub fn open(&self, purpose: Purpose) -> CacheResult<Partition> {
    let partition = self.partition(purpose);
    self.storage.ensure_partition(&partition)?;
    Ok(partition)
  }

  /// Look up an entry. Corrupt entries are evicted and reported as a miss.
  pub fn get(&self, partition: &Partition, key: &EntryKey) -> CacheResult<Option<Entry>> {
    match self.storage.get(&partition.name, key) {
      Err(CacheError::PartitionCorrupt { reason, .. }) => {
        warn!(
          partition = %partition,
          key = %key,
          reason = %reason,
          "Evicting corrupt cache entry"
        );
        self.storage.remove(&partition.name, key)?;
        Ok(None)
      }
      other => other,
    }
  }

  /// Like `get`, but a missing entry is a `CacheMiss` error.
  pub fn require(&self, partition: &Partition, key: &EntryKey) -> CacheResult<Entry> {
    self
      .get(partition, key)?
      .ok_or_else(|| CacheError::CacheMiss {
        key: key.to_string(),
      })
  }

  /// Store an entry. Writes into a retired partition are dropped so a late
  /// write from a superseded version cannot bring it back.
  pub fn put(&self, partition: &Partition, entry: &Entry) -> CacheResult<()> {
    if self.is_retired(&partition.name) {
      info!(partition = %partition, key = %entry.key, "skipping write to retired partition");
      return Ok(());
    }
    debug!(partition = %partition, key = %entry.key, status = entry.response.status, "cache put");
    self.storage.put(partition, entry)
  }

  pub fn purge(&self, name: &str) -> CacheResult<bool> {
    self.storage.drop_partition(name)
  }

  /// Delete a partition for good: later writes to it are ignored.
  pub fn retire(&self, name: &str) -> CacheResult<bool> {
    rw_write(&self.retired, SOURCE, "retire").insert(name.to_string());
    self.purge(name)
  }

  pub fn is_retired(&self, name: &str) -> bool {
    rw_read(&self.retired, SOURCE, "is_retired").contains(name)
  }

  pub fn purge_all(&self) -> CacheResult<usize> {
    self.storage.drop_all()
  }

  pub fn list_partitions(&self) -> CacheResult<BTreeSet<String>> {
    Ok(
      self
        .storage
        .partitions()?
        .into_iter()
        .map(|p| p.name)
        .collect(),
    )
  }

  pub fn partitions(&self) -> CacheResult<Vec<Partition>> {
    self.storage.partitions()
  }

  pub fn entry_count(&self, name: &str) -> CacheResult<usize> {
    self.storage.entry_count(name)
  }
}
