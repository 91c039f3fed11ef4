//! Core traits and types for the caching system.

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};

/// Entries older than this many seconds are considered absent.
pub const CACHE_DURATION_SECS: i64 = 5 * 60;

/// Entries older than this many seconds are served but trigger a background refetch.
pub const STALE_WHILE_REVALIDATE_SECS: i64 = 60;

/// A cached value with the time it was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub data: serde_json::Value,
  pub timestamp: DateTime<Utc>,
}

impl CacheEntry {
  pub fn new(data: serde_json::Value, timestamp: DateTime<Utc>) -> Self {
    Self { data, timestamp }
  }

  /// Age of the entry at `now`. Negative when the clock moved backwards.
  pub fn age(&self, now: DateTime<Utc>) -> Duration {
    now - self.timestamp
  }
}

/// A single tier of cache storage.
///
/// Implementations may fail (disk full, database locked); callers treat
/// failures as a miss rather than surfacing them.
pub trait CachePort: Send + Sync {
  /// Look up an entry without any age filtering.
  fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

  /// Look up an entry written at or after `cutoff`.
  ///
  /// Tiers that compose others override this so an old entry in one tier
  /// does not hide a newer one behind it.
  fn get_since(&self, key: &str, cutoff: DateTime<Utc>) -> Result<Option<CacheEntry>> {
    Ok(self.get(key)?.filter(|entry| entry.timestamp >= cutoff))
  }

  /// Insert or overwrite an entry.
  fn set(&self, key: &str, entry: &CacheEntry) -> Result<()>;

  /// Whether the tier holds an entry for `key`, regardless of age.
  fn contains(&self, key: &str) -> Result<bool> {
    Ok(self.get(key)?.is_some())
  }
}

/// How old an entry is relative to the freshness windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Age {
  Fresh,
  Stale,
  Expired,
}

/// Freshness and expiry windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
  pub stale_after: Duration,
  pub expire_after: Duration,
}

impl Default for Freshness {
  fn default() -> Self {
    Self {
      stale_after: Duration::seconds(STALE_WHILE_REVALIDATE_SECS),
      expire_after: Duration::seconds(CACHE_DURATION_SECS),
    }
  }
}

impl Freshness {
  pub fn new(stale_after: Duration, expire_after: Duration) -> Self {
    Self {
      stale_after,
      expire_after,
    }
  }

  pub fn classify(&self, age: Duration) -> Age {
    if age > self.expire_after {
      Age::Expired
    } else if age > self.stale_after {
      Age::Stale
    } else {
      Age::Fresh
    }
  }
}

/// Typed result of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
  pub data: T,
  pub is_stale: bool,
  pub cached_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_classify_windows() {
    let policy = Freshness::default();
    assert_eq!(policy.classify(Duration::zero()), Age::Fresh);
    assert_eq!(policy.classify(Duration::seconds(60)), Age::Fresh);
    assert_eq!(policy.classify(Duration::seconds(61)), Age::Stale);
    assert_eq!(policy.classify(Duration::seconds(300)), Age::Stale);
    assert_eq!(policy.classify(Duration::seconds(301)), Age::Expired);
  }

  #[test]
  fn test_clock_skew_counts_as_fresh() {
    let policy = Freshness::default();
    assert_eq!(policy.classify(Duration::seconds(-30)), Age::Fresh);
  }
}
