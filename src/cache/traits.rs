//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

/// Trait for values that can be stored in the persistent cache.
///
/// A "blank" value (an empty list, a missing record) is never served from
/// cache: it falls through to the remote source so that a cache written
/// before any data existed cannot mask real data later.
pub trait Cacheable: Default + Send + Sync + Serialize + DeserializeOwned + 'static {
  fn is_blank(&self) -> bool;
}

impl<T> Cacheable for Vec<T>
where
  T: Send + Sync + Serialize + DeserializeOwned + 'static,
{
  fn is_blank(&self) -> bool {
    self.is_empty()
  }
}

impl<T> Cacheable for Option<T>
where
  T: Send + Sync + Serialize + DeserializeOwned + 'static,
{
  fn is_blank(&self) -> bool {
    self.is_none()
  }
}

/// Entities that live inside a cached collection and can be looked up by id.
pub trait Entity {
  fn entity_id(&self) -> &str;
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from a fresh cache hit.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: Some(cached_at),
    }
  }

  /// Remote failed, serving the last value the caller already held.
  pub fn offline(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: None,
    }
  }

  /// Remote failed and nothing was available to fall back on.
  pub fn empty(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Empty,
      cached_at: None,
    }
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh (a refresh runs in the background)
  CacheFresh,
  /// Network unavailable, serving last-known data
  Offline,
  /// Network unavailable and no fallback existed
  Empty,
}
