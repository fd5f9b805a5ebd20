//! Offline-first read-through caching.
//!
//! This module provides a source-agnostic caching mechanism that:
//! - Persists JSON values by key with a write timestamp (SQLite)
//! - Expires entries on read once they exceed a caller-supplied age
//! - Never surfaces storage failures: the cache is an accelerator, not the source of truth
//! - Serves fresh hits immediately and revalidates them in the background

mod layer;
mod lossy;
mod persistent;
mod storage;
mod traits;

pub use layer::{CacheLayer, ReadOptions};
pub use persistent::PersistentCache;
pub use traits::{CacheResult, CacheSource, Cacheable, Entity};
