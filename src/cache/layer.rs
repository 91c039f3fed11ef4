//! Cache layer that composes storage tiers and applies freshness rules.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::clock::{Clock, SystemClock};
use super::traits::{Age, CacheEntry, CachePort, Cached, Freshness};

/// Two tiers composed front-to-back.
///
/// Reads hit `front` first and fall through to `back`; an entry found only in
/// `back` is promoted into `front`. Writes go to both. A failing tier is
/// logged and treated as a miss. Age is never judged here: the caller passes
/// a cutoff to [`CachePort::get_since`].
pub struct ReadThrough<F: CachePort, B: CachePort> {
  front: F,
  back: B,
}

impl<F: CachePort, B: CachePort> ReadThrough<F, B> {
  pub fn new(front: F, back: B) -> Self {
    Self { front, back }
  }

  pub fn front(&self) -> &F {
    &self.front
  }

  pub fn back(&self) -> &B {
    &self.back
  }

  fn lookup(&self, key: &str, cutoff: Option<DateTime<Utc>>) -> Option<CacheEntry> {
    let front = match cutoff {
      Some(cutoff) => self.front.get_since(key, cutoff),
      None => self.front.get(key),
    };
    match front {
      Ok(Some(entry)) => return Some(entry),
      Ok(None) => {}
      Err(e) => warn!(key, error = %e, "Front cache tier read failed"),
    }

    let back = match cutoff {
      Some(cutoff) => self.back.get_since(key, cutoff),
      None => self.back.get(key),
    };
    let entry = match back {
      Ok(Some(entry)) => entry,
      Ok(None) => return None,
      Err(e) => {
        warn!(key, error = %e, "Back cache tier read failed");
        return None;
      }
    };

    debug!(key, "Promoting persisted cache entry");
    if let Err(e) = self.front.set(key, &entry) {
      warn!(key, error = %e, "Front cache tier write failed");
    }
    Some(entry)
  }
}

impl<F: CachePort, B: CachePort> CachePort for ReadThrough<F, B> {
  fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
    Ok(self.lookup(key, None))
  }

  fn get_since(&self, key: &str, cutoff: DateTime<Utc>) -> Result<Option<CacheEntry>> {
    Ok(self.lookup(key, Some(cutoff)))
  }

  fn set(&self, key: &str, entry: &CacheEntry) -> Result<()> {
    if let Err(e) = self.front.set(key, entry) {
      warn!(key, error = %e, "Front cache tier write failed");
    }
    if let Err(e) = self.back.set(key, entry) {
      warn!(key, error = %e, "Back cache tier write failed");
    }
    Ok(())
  }

  /// Only the persisted tier decides whether a key already exists.
  fn contains(&self, key: &str) -> Result<bool> {
    self.back.contains(key)
  }
}

/// Typed, best-effort cache over a storage port.
///
/// Every failure (storage, serialization) is logged and reported as a miss,
/// so callers fall back to fetching.
pub struct CacheLayer<S: CachePort> {
  storage: Arc<S>,
  freshness: Freshness,
  clock: Arc<dyn Clock>,
}

impl<S: CachePort> CacheLayer<S> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
      freshness: Freshness::default(),
      clock: Arc::new(SystemClock),
    }
  }

  pub fn with_freshness(mut self, freshness: Freshness) -> Self {
    self.freshness = freshness;
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  pub fn freshness(&self) -> Freshness {
    self.freshness
  }

  /// Look up a valid entry, reporting whether it is stale.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<Cached<T>> {
    let now = self.clock.now();
    let entry = match self.storage.get_since(key, now - self.freshness.expire_after) {
      Ok(Some(entry)) => entry,
      Ok(None) => return None,
      Err(e) => {
        warn!(key, error = %e, "Cache read failed");
        return None;
      }
    };

    let is_stale = match self.freshness.classify(entry.age(now)) {
      Age::Expired => return None,
      Age::Stale => true,
      Age::Fresh => false,
    };

    match serde_json::from_value(entry.data) {
      Ok(data) => Some(Cached {
        data,
        is_stale,
        cached_at: entry.timestamp,
      }),
      Err(e) => {
        warn!(key, error = %e, "Cached entry has unexpected shape");
        None
      }
    }
  }

  /// Store `data` stamped with the current time.
  pub fn set<T: Serialize>(&self, key: &str, data: &T) {
    let data = match serde_json::to_value(data) {
      Ok(data) => data,
      Err(e) => {
        warn!(key, error = %e, "Failed to serialize cache entry");
        return;
      }
    };

    let entry = CacheEntry::new(data, self.clock.now());
    if let Err(e) = self.storage.set(key, &entry) {
      warn!(key, error = %e, "Cache write failed");
    }
  }

  /// Whether an entry exists for `key`, regardless of age.
  pub fn contains(&self, key: &str) -> bool {
    self.storage.contains(key).unwrap_or_else(|e| {
      warn!(key, error = %e, "Cache lookup failed");
      false
    })
  }
}

impl<S: CachePort> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      freshness: self.freshness,
      clock: Arc::clone(&self.clock),
    }
  }
}
