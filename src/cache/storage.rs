//! Cache storage tiers: in-process memory, SQLite, and a no-op backend.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use super::traits::{CacheEntry, CachePort};

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CachePort for NoopStorage {
  fn get(&self, _key: &str) -> Result<Option<CacheEntry>> {
    Ok(None) // Always miss
  }

  fn set(&self, _key: &str, _entry: &CacheEntry) -> Result<()> {
    Ok(()) // Discard
  }
}

/// Process-local map of entries.
#[derive(Default)]
pub struct MemoryStorage {
  entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.entries.read().map(|e| e.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl CachePort for MemoryStorage {
  fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
    let entries = self
      .entries
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.get(key).cloned())
  }

  fn set(&self, key: &str, entry: &CacheEntry) -> Result<()> {
    let mut entries = self
      .entries
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.insert(key.to_string(), entry.clone());
    Ok(())
  }
}

/// Default prefix applied to keys in the persisted tier.
pub const DEFAULT_KEY_PREFIX: &str = "spsync_cache_";

/// SQLite-based persisted cache tier.
///
/// Keys are stored as `prefix + key` so several applications can share one
/// database file without colliding.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  prefix: String,
}

impl SqliteStorage {
  /// Open the cache database at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Open (or create) the cache database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
      prefix: DEFAULT_KEY_PREFIX.to_string(),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Use a different key prefix.
  pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
    self.prefix = prefix.into();
    self
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("spsync").join("cache.db"))
  }

  fn prefixed(&self, key: &str) -> String {
    format!("{}{}", self.prefix, key)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  /// Delete entries under this prefix written before `cutoff`.
  ///
  /// Returns the number of rows removed.
  pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let pattern = format!("{}%", escape_like(&self.prefix));
    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE key LIKE ? ESCAPE '\\' AND cached_at < ?",
        params![pattern, format_datetime(cutoff)],
      )
      .map_err(|e| eyre!("Failed to purge cache entries: {}", e))?;

    Ok(removed)
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    cached_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_cached_at
    ON cache_entries(cached_at);
"#;

impl CachePort for SqliteStorage {
  fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(String, String)> = conn
      .query_row(
        "SELECT data, cached_at FROM cache_entries WHERE key = ?",
        params![self.prefixed(key)],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", key, e))?;

    match row {
      Some((data, cached_at)) => {
        let data = serde_json::from_str(&data)
          .map_err(|e| eyre!("Failed to deserialize cache entry {}: {}", key, e))?;
        let timestamp = parse_datetime(&cached_at)?;
        Ok(Some(CacheEntry { data, timestamp }))
      }
      None => Ok(None),
    }
  }

  fn set(&self, key: &str, entry: &CacheEntry) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let data = serde_json::to_string(&entry.data)
      .map_err(|e| eyre!("Failed to serialize cache entry {}: {}", key, e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries (key, data, cached_at) VALUES (?, ?, ?)",
        params![self.prefixed(key), data, format_datetime(entry.timestamp)],
      )
      .map_err(|e| eyre!("Failed to store cache entry {}: {}", key, e))?;

    Ok(())
  }

  fn contains(&self, key: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM cache_entries WHERE key = ?",
        params![self.prefixed(key)],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to check cache entry {}: {}", key, e))?;

    Ok(found.is_some())
  }
}

/// Timestamps are stored as RFC 3339 with fixed millisecond precision so
/// lexical order matches time order.
fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

fn escape_like(s: &str) -> String {
  s.replace('\\', "\\\\")
    .replace('%', "\\%")
    .replace('_', "\\_")
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;
  use serde_json::json;

  fn entry(value: serde_json::Value, at: DateTime<Utc>) -> CacheEntry {
    CacheEntry::new(value, at)
  }

  #[test]
  fn test_memory_set_then_get() {
    let storage = MemoryStorage::new();
    let now = Utc::now();
    storage.set("a", &entry(json!({"count": 5}), now)).unwrap();

    let got = storage.get("a").unwrap().unwrap();
    assert_eq!(got.data, json!({"count": 5}));
    assert_eq!(got.timestamp, now);
    assert!(storage.get("b").unwrap().is_none());
  }

  #[test]
  fn test_sqlite_round_trips_entry() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let now = Utc::now();
    storage
      .set("dash-A", &entry(json!({"count": 5}), now))
      .unwrap();

    let got = storage.get("dash-A").unwrap().unwrap();
    assert_eq!(got.data, json!({"count": 5}));
    // Stored at millisecond precision
    assert!((got.timestamp - now).num_milliseconds().abs() < 1);
    assert!(storage.contains("dash-A").unwrap());
    assert!(!storage.contains("dash-B").unwrap());
  }

  #[test]
  fn test_sqlite_overwrite_is_last_write_wins() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let now = Utc::now();
    storage.set("k", &entry(json!(1), now)).unwrap();
    storage
      .set("k", &entry(json!(2), now + Duration::seconds(5)))
      .unwrap();

    assert_eq!(storage.get("k").unwrap().unwrap().data, json!(2));
  }

  #[test]
  fn test_sqlite_prefixes_isolate_keys() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let a = SqliteStorage::open_at(&path).unwrap().with_prefix("a_");
    let b = SqliteStorage::open_at(&path).unwrap().with_prefix("b_");

    a.set("k", &entry(json!("from a"), Utc::now())).unwrap();

    assert!(a.contains("k").unwrap());
    assert!(!b.contains("k").unwrap());
  }

  #[test]
  fn test_sqlite_shared_file_is_visible_to_new_handles() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    {
      let writer = SqliteStorage::open_at(&path).unwrap();
      writer.set("k", &entry(json!([1, 2]), Utc::now())).unwrap();
    }

    let reader = SqliteStorage::open_at(&path).unwrap();
    assert_eq!(reader.get("k").unwrap().unwrap().data, json!([1, 2]));
  }

  #[test]
  fn test_purge_older_than_keeps_recent_entries() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let now = Utc::now();
    storage
      .set("old", &entry(json!(1), now - Duration::minutes(10)))
      .unwrap();
    storage.set("new", &entry(json!(2), now)).unwrap();

    let removed = storage
      .purge_older_than(now - Duration::minutes(5))
      .unwrap();

    assert_eq!(removed, 1);
    assert!(!storage.contains("old").unwrap());
    assert!(storage.contains("new").unwrap());
  }

  #[test]
  fn test_purge_ignores_other_prefixes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let mine = SqliteStorage::open_at(&path).unwrap().with_prefix("mine_");
    let theirs = SqliteStorage::open_at(&path).unwrap().with_prefix("theirs_");
    let old = Utc::now() - Duration::hours(1);
    mine.set("k", &entry(json!(1), old)).unwrap();
    theirs.set("k", &entry(json!(1), old)).unwrap();

    assert_eq!(mine.purge_older_than(Utc::now()).unwrap(), 1);
    assert!(theirs.contains("k").unwrap());
  }

  #[test]
  fn test_noop_always_misses() {
    let storage = NoopStorage;
    storage.set("k", &entry(json!(1), Utc::now())).unwrap();
    assert!(storage.get("k").unwrap().is_none());
    assert!(!storage.contains("k").unwrap());
  }
}
