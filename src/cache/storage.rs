//! Cache storage trait with SQLite and in-memory implementations.

use bytes::Bytes;
use chrono::DateTime;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, RwLock};

use crate::classifier::ResourceCategory;
use crate::error::{CacheError, CacheResult};

use super::entry::{CachedResponse, Entry, EntryKey};
use super::lock::{mutex_lock, rw_read, rw_write};
use super::manager::{Partition, Purpose};

const SOURCE: &str = "cache::storage";

/// Trait for cache storage backends.
///
/// Every method is atomic with respect to the others: a reader never
/// observes a half-written entry.
pub trait CacheStorage: Send + Sync {
  /// Create the partition if it does not exist yet.
  fn ensure_partition(&self, partition: &Partition) -> CacheResult<()>;

  /// Get an entry. Undecodable rows surface as `PartitionCorrupt`.
  fn get(&self, partition: &str, key: &EntryKey) -> CacheResult<Option<Entry>>;

  /// Insert or overwrite an entry, creating the partition on demand.
  ///
  /// The stored capture time never moves backwards for a given key.
  fn put(&self, partition: &Partition, entry: &Entry) -> CacheResult<()>;

  fn remove(&self, partition: &str, key: &EntryKey) -> CacheResult<bool>;

  /// Delete a partition and all its entries.
  fn drop_partition(&self, name: &str) -> CacheResult<bool>;

  /// Delete every partition. Returns how many were removed.
  fn drop_all(&self) -> CacheResult<usize>;

  fn partitions(&self) -> CacheResult<Vec<Partition>>;

  fn entry_count(&self, partition: &str) -> CacheResult<usize>;
}

// ============================================================================
// SQLite
// ============================================================================

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    version TEXT NOT NULL,
    purpose TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS entries (
    partition TEXT NOT NULL,
    digest TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    category TEXT NOT NULL,
    captured_at INTEGER NOT NULL,
    PRIMARY KEY (partition, digest)
);
"#;

impl SqliteStorage {
  /// Open (or create) a cache database at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }
}

fn insert_partition(conn: &Connection, partition: &Partition) -> rusqlite::Result<usize> {
  conn.execute(
    "INSERT OR IGNORE INTO partitions (name, version, purpose) VALUES (?1, ?2, ?3)",
    params![
      partition.name,
      partition.version,
      partition.purpose.as_str()
    ],
  )
}

impl CacheStorage for SqliteStorage {
  fn ensure_partition(&self, partition: &Partition) -> CacheResult<()> {
    let conn = mutex_lock(&self.conn, SOURCE, "ensure_partition");
    insert_partition(&conn, partition)?;
    Ok(())
  }

  fn get(&self, partition: &str, key: &EntryKey) -> CacheResult<Option<Entry>> {
    let conn = mutex_lock(&self.conn, SOURCE, "get");

    let row = conn
      .query_row(
        "SELECT method, url, status, headers, body, category, captured_at
         FROM entries WHERE partition = ?1 AND digest = ?2",
        params![partition, key.digest()],
        |row| {
          Ok(RawEntry {
            method: row.get(0)?,
            url: row.get(1)?,
            status: row.get(2)?,
            headers: row.get(3)?,
            body: row.get(4)?,
            category: row.get(5)?,
            captured_at: row.get(6)?,
          })
        },
      )
      .optional()?;

    row
      .map(|raw| {
        raw.decode().map_err(|reason| CacheError::PartitionCorrupt {
          partition: partition.to_string(),
          key: key.to_string(),
          reason,
        })
      })
      .transpose()
  }

  fn put(&self, partition: &Partition, entry: &Entry) -> CacheResult<()> {
    let mut conn = mutex_lock(&self.conn, SOURCE, "put");
    let headers = serde_json::to_string(&entry.response.headers)
      .map_err(|e| CacheError::Storage(format!("Failed to serialize headers: {e}")))?;

    let tx = conn.transaction()?;
    insert_partition(&tx, partition)?;
    tx.execute(
      "INSERT INTO entries (partition, digest, method, url, status, headers, body, category, captured_at)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
       ON CONFLICT (partition, digest) DO UPDATE SET
         method = excluded.method,
         url = excluded.url,
         status = excluded.status,
         headers = excluded.headers,
         body = excluded.body,
         category = excluded.category,
         captured_at = MAX(entries.captured_at, excluded.captured_at)",
      params![
        partition.name,
        entry.key.digest(),
        entry.key.method,
        entry.key.url,
        entry.response.status,
        headers,
        entry.response.body.as_ref(),
        entry.category.as_str(),
        entry.captured_at.timestamp_millis(),
      ],
    )?;
    tx.commit()?;

    Ok(())
  }

  fn remove(&self, partition: &str, key: &EntryKey) -> CacheResult<bool> {
    let conn = mutex_lock(&self.conn, SOURCE, "remove");
    let removed = conn.execute(
      "DELETE FROM entries WHERE partition = ?1 AND digest = ?2",
      params![partition, key.digest()],
    )?;
    Ok(removed > 0)
  }

  fn drop_partition(&self, name: &str) -> CacheResult<bool> {
    let mut conn = mutex_lock(&self.conn, SOURCE, "drop_partition");
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM entries WHERE partition = ?1", params![name])?;
    let removed = tx.execute("DELETE FROM partitions WHERE name = ?1", params![name])?;
    tx.commit()?;
    Ok(removed > 0)
  }

  fn drop_all(&self) -> CacheResult<usize> {
    let mut conn = mutex_lock(&self.conn, SOURCE, "drop_all");
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM entries", [])?;
    let removed = tx.execute("DELETE FROM partitions", [])?;
    tx.commit()?;
    Ok(removed)
  }

  fn partitions(&self) -> CacheResult<Vec<Partition>> {
    let conn = mutex_lock(&self.conn, SOURCE, "partitions");
    let mut stmt = conn.prepare("SELECT name, version, purpose FROM partitions ORDER BY name")?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
        ))
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    // Rows with an unknown purpose still have to be listed so activation can collect them.
    Ok(
      rows
        .into_iter()
        .map(|(name, version, purpose)| Partition {
          purpose: purpose.parse().unwrap_or(Purpose::Unknown),
          name,
          version,
        })
        .collect(),
    )
  }

  fn entry_count(&self, partition: &str) -> CacheResult<usize> {
    let conn = mutex_lock(&self.conn, SOURCE, "entry_count");
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM entries WHERE partition = ?1",
      params![partition],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }
}

#[cfg(test)]
impl SqliteStorage {
  /// Overwrite every stored header blob in a partition with garbage.
  pub(crate) fn corrupt_for_test(&self, partition: &str) {
    mutex_lock(&self.conn, SOURCE, "corrupt_for_test")
      .execute(
        "UPDATE entries SET headers = 'not json' WHERE partition = ?1",
        params![partition],
      )
      .unwrap();
  }
}

/// A row as read from SQLite, before validation.
struct RawEntry {
  method: String,
  url: String,
  status: i64,
  headers: String,
  body: Vec<u8>,
  category: String,
  captured_at: i64,
}

impl RawEntry {
  fn decode(self) -> std::result::Result<Entry, String> {
    let status = u16::try_from(self.status)
      .ok()
      .filter(|s| (100..600).contains(s))
      .ok_or_else(|| format!("invalid status {}", self.status))?;
    let headers: Vec<(String, String)> =
      serde_json::from_str(&self.headers).map_err(|e| format!("invalid headers: {e}"))?;
    let category: ResourceCategory = self.category.parse()?;
    let captured_at = DateTime::from_timestamp_millis(self.captured_at)
      .ok_or_else(|| format!("invalid capture time {}", self.captured_at))?;

    Ok(Entry {
      key: EntryKey {
        method: self.method,
        url: self.url,
      },
      response: CachedResponse {
        status,
        headers,
        body: Bytes::from(self.body),
      },
      captured_at,
      category,
    })
  }
}

// ============================================================================
// In-memory
// ============================================================================

struct MemoryPartition {
  partition: Partition,
  entries: HashMap<String, Entry>,
}

/// Process-local storage. Readers proceed concurrently; writers are serialized.
#[derive(Default)]
pub struct MemoryStorage {
  partitions: RwLock<BTreeMap<String, MemoryPartition>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl CacheStorage for MemoryStorage {
  fn ensure_partition(&self, partition: &Partition) -> CacheResult<()> {
    rw_write(&self.partitions, SOURCE, "memory.ensure_partition")
      .entry(partition.name.clone())
      .or_insert_with(|| MemoryPartition {
        partition: partition.clone(),
        entries: HashMap::new(),
      });
    Ok(())
  }

  fn get(&self, partition: &str, key: &EntryKey) -> CacheResult<Option<Entry>> {
    Ok(
      rw_read(&self.partitions, SOURCE, "memory.get")
        .get(partition)
        .and_then(|p| p.entries.get(&key.digest()))
        .cloned(),
    )
  }

  fn put(&self, partition: &Partition, entry: &Entry) -> CacheResult<()> {
    let mut partitions = rw_write(&self.partitions, SOURCE, "memory.put");
    let slot = partitions
      .entry(partition.name.clone())
      .or_insert_with(|| MemoryPartition {
        partition: partition.clone(),
        entries: HashMap::new(),
      });

    let digest = entry.key.digest();
    let mut entry = entry.clone();
    if let Some(existing) = slot.entries.get(&digest) {
      entry.captured_at = entry.captured_at.max(existing.captured_at);
    }
    slot.entries.insert(digest, entry);
    Ok(())
  }

  fn remove(&self, partition: &str, key: &EntryKey) -> CacheResult<bool> {
    Ok(
      rw_write(&self.partitions, SOURCE, "memory.remove")
        .get_mut(partition)
        .and_then(|p| p.entries.remove(&key.digest()))
        .is_some(),
    )
  }

  fn drop_partition(&self, name: &str) -> CacheResult<bool> {
    Ok(
      rw_write(&self.partitions, SOURCE, "memory.drop_partition")
        .remove(name)
        .is_some(),
    )
  }

  fn drop_all(&self) -> CacheResult<usize> {
    let mut partitions = rw_write(&self.partitions, SOURCE, "memory.drop_all");
    let removed = partitions.len();
    partitions.clear();
    Ok(removed)
  }

  fn partitions(&self) -> CacheResult<Vec<Partition>> {
    Ok(
      rw_read(&self.partitions, SOURCE, "memory.partitions")
        .values()
        .map(|p| p.partition.clone())
        .collect(),
    )
  }

  fn entry_count(&self, partition: &str) -> CacheResult<usize> {
    Ok(
      rw_read(&self.partitions, SOURCE, "memory.entry_count")
        .get(partition)
        .map_or(0, |p| p.entries.len()),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{Duration, Utc};
  use url::Url;

  fn partition() -> Partition {
    Partition::new(Purpose::Api, "v1")
  }

  fn entry(url: &str, body: &'static str) -> Entry {
    Entry {
      key: EntryKey::new("GET", &Url::parse(url).unwrap()),
      response: CachedResponse::new(
        200,
        vec![("content-type".into(), "application/json".into())],
        body,
      ),
      captured_at: DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap(),
      category: ResourceCategory::CacheableApi,
    }
  }

  fn backends() -> Vec<(&'static str, Box<dyn CacheStorage>)> {
    vec![
      ("sqlite", Box::new(SqliteStorage::open_in_memory().unwrap())),
      ("memory", Box::new(MemoryStorage::new())),
    ]
  }

  #[test]
  fn test_put_then_get_is_byte_identical() {
    for (name, storage) in backends() {
      let e = entry("http://o/api/flights?airport=JAC", r#"[{"id":1}]"#);
      storage.put(&partition(), &e).unwrap();

      let got = storage.get("api-v1", &e.key).unwrap().expect(name);
      assert_eq!(got, e, "{name}");
    }
  }

  #[test]
  fn test_put_overwrites_and_keeps_single_key() {
    for (name, storage) in backends() {
      let first = entry("http://o/api/flights", "old");
      let mut second = entry("http://o/api/flights", "new");
      second.captured_at = first.captured_at + Duration::seconds(5);

      storage.put(&partition(), &first).unwrap();
      storage.put(&partition(), &second).unwrap();

      let got = storage.get("api-v1", &first.key).unwrap().unwrap();
      assert_eq!(got.response.body, Bytes::from("new"), "{name}");
      assert_eq!(storage.entry_count("api-v1").unwrap(), 1, "{name}");
    }
  }

  #[test]
  fn test_capture_time_never_moves_backwards() {
    for (name, storage) in backends() {
      let newer = entry("http://o/api/flights", "newer");
      let mut older = entry("http://o/api/flights", "older-write");
      older.captured_at = newer.captured_at - Duration::minutes(1);

      storage.put(&partition(), &newer).unwrap();
      storage.put(&partition(), &older).unwrap();

      let got = storage.get("api-v1", &newer.key).unwrap().unwrap();
      assert_eq!(got.response.body, Bytes::from("older-write"), "{name}");
      assert_eq!(got.captured_at, newer.captured_at, "{name}");
    }
  }

  #[test]
  fn test_concurrent_puts_last_write_wins_without_corruption() {
    const WRITERS: usize = 8;
    const ROUNDS: usize = 50;

    for (name, storage) in backends() {
      let storage = &*storage;
      let key = entry("http://o/api/flights", "").key;
      let bodies: Vec<String> = (0..WRITERS).map(|w| format!(r#"[{{"writer":{w}}}]"#)).collect();

      std::thread::scope(|scope| {
        for body in &bodies {
          scope.spawn(move || {
            for _ in 0..ROUNDS {
              let mut e = entry("http://o/api/flights", "");
              e.response.body = Bytes::from(body.clone());
              storage.put(&partition(), &e).unwrap();
            }
          });
        }
        scope.spawn(|| {
          for _ in 0..ROUNDS {
            // readers see either nothing yet or one whole write
            if let Some(got) = storage.get("api-v1", &key).unwrap() {
              assert!(bodies.iter().any(|b| got.response.body == b.as_bytes()), "{name}");
            }
          }
        });
      });

      let last = storage.get("api-v1", &key).unwrap().expect(name);
      assert!(
        bodies.iter().any(|b| last.response.body == b.as_bytes()),
        "{name}"
      );
      assert_eq!(storage.entry_count("api-v1").unwrap(), 1, "{name}");
    }
  }

  #[test]
  fn test_drop_partition_and_drop_all() {
    for (name, storage) in backends() {
      storage.put(&partition(), &entry("http://o/a", "a")).unwrap();
      storage
        .ensure_partition(&Partition::new(Purpose::Static, "v1"))
        .unwrap();
      assert_eq!(storage.partitions().unwrap().len(), 2, "{name}");

      assert!(storage.drop_partition("api-v1").unwrap());
      assert!(!storage.drop_partition("api-v1").unwrap());
      assert_eq!(storage.entry_count("api-v1").unwrap(), 0, "{name}");

      assert_eq!(storage.drop_all().unwrap(), 1, "{name}");
      assert!(storage.partitions().unwrap().is_empty(), "{name}");
    }
  }

  #[test]
  fn test_ensure_partition_is_idempotent() {
    for (name, storage) in backends() {
      let p = Partition::new(Purpose::Images, "v2");
      storage.ensure_partition(&p).unwrap();
      storage.ensure_partition(&p).unwrap();
      let listed = storage.partitions().unwrap();
      assert_eq!(listed, vec![p.clone()], "{name}");
    }
  }

  #[test]
  fn test_corrupt_row_reports_partition_corrupt() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let e = entry("http://o/api/flights", "[]");
    storage.put(&partition(), &e).unwrap();

    storage.corrupt_for_test("api-v1");

    let err = storage.get("api-v1", &e.key).unwrap_err();
    assert!(matches!(err, CacheError::PartitionCorrupt { .. }));
  }
}
