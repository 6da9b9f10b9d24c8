//! Versioned cache partitions, storage backends and freshness tracking.
//!
//! This module knows nothing about HTTP strategies. It provides:
//! - Named partitions (`static-v1`, `api-v1`, ...) over a storage backend
//! - SQLite for durable storage and an in-memory store for tests
//! - Capture-time stamping and per-category TTL evaluation

mod entry;
mod freshness;
mod lock;
mod manager;
mod storage;

pub use entry::{CacheSource, CachedResponse, Entry, EntryKey, Served};
pub use freshness::{Clock, FreshnessTracker, ManualClock, SystemClock, TtlPolicy};
pub(crate) use lock::{mutex_lock, rw_read, rw_write};
pub use manager::{CacheManager, Partition, Purpose};
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
