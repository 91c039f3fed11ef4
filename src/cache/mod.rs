//! Two-tier stale-while-revalidate cache.
//!
//! This module provides a storage-agnostic caching mechanism that:
//! - Stores JSON values stamped with the time they were written
//! - Composes an in-process tier with a persisted tier via [`ReadThrough`]
//! - Classifies entries as fresh, stale, or expired against an injected [`Clock`]
//! - Degrades to "no cache" when a tier fails

mod clock;
mod layer;
mod storage;
mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use layer::{CacheLayer, ReadThrough};
pub use storage::{MemoryStorage, NoopStorage, SqliteStorage, DEFAULT_KEY_PREFIX};
pub use traits::{
  Age, CacheEntry, CachePort, Cached, Freshness, CACHE_DURATION_SECS,
  STALE_WHILE_REVALIDATE_SECS,
};
