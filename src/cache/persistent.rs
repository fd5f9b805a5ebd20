//! Fail-open async facade over the key/value storage.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use super::lossy;
use super::storage::{KvStorage, SqliteStorage, StoredEntry, UnavailableStorage};
use crate::clock::{Clock, SystemClock};

/// A single cached value.
#[derive(Debug, Clone)]
pub struct CachedEntry<T> {
  /// The cached value
  pub value: T,
  /// When the value was written
  pub cached_at: DateTime<Utc>,
}

/// Durable key/value cache.
///
/// Every operation is best-effort: storage errors are logged and turned into
/// a miss (`get`) or `false` (`set`/`delete`), never returned to the caller.
#[derive(Clone)]
pub struct PersistentCache {
  storage: Arc<dyn KvStorage>,
  clock: Arc<dyn Clock>,
}

impl PersistentCache {
  pub fn new(storage: impl KvStorage, clock: Arc<dyn Clock>) -> Self {
    Self {
      storage: Arc::new(storage),
      clock,
    }
  }

  /// Open the SQLite cache at `path` (or the default location).
  ///
  /// If the storage engine cannot be set up the cache is returned in its
  /// unavailable state rather than failing.
  pub fn open(path: Option<&Path>) -> Self {
    let storage = match path {
      Some(p) => SqliteStorage::open(p),
      None => SqliteStorage::default_path().and_then(|p| SqliteStorage::open(&p)),
    };

    match storage {
      Ok(storage) => Self::new(storage, Arc::new(SystemClock)),
      Err(e) => {
        warn!("Persistent cache unavailable: {}", e);
        Self::unavailable()
      }
    }
  }

  /// A cache that always misses.
  pub fn unavailable() -> Self {
    Self::new(UnavailableStorage, Arc::new(SystemClock))
  }

  pub fn clock(&self) -> Arc<dyn Clock> {
    Arc::clone(&self.clock)
  }

  /// Read a value together with its write time.
  ///
  /// `max_age` of `None` (or negative) disables the age check. Stale entries
  /// are deleted and reported as a miss.
  pub async fn get_entry<T: DeserializeOwned>(
    &self,
    key: &str,
    max_age: Option<Duration>,
  ) -> Option<CachedEntry<T>> {
    let max_age_ms = max_age
      .map(|d| d.num_milliseconds())
      .filter(|ms| *ms >= 0);
    let now = self.clock.now_millis();

    let stored = self
      .blocking(key, move |storage, key| storage.read(&key, max_age_ms, now))
      .await
      .unwrap_or_else(|e| {
        debug!("Cache read for {} failed: {}", key, e);
        None
      })?;

    decode(key, stored)
  }

  /// Read a value, see [`PersistentCache::get_entry`].
  pub async fn get<T: DeserializeOwned>(&self, key: &str, max_age: Option<Duration>) -> Option<T> {
    self.get_entry(key, max_age).await.map(|entry| entry.value)
  }

  /// Store a value stamped with the current time, fully replacing any
  /// previous entry for `key`.
  pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
    let json = match encode(value) {
      Ok(json) => json,
      Err(e) => {
        warn!("Not caching {}: {}", key, e);
        return false;
      }
    };
    let now = self.clock.now_millis();

    match self
      .blocking(key, move |storage, key| storage.write(&key, &json, now))
      .await
    {
      Ok(()) => true,
      Err(e) => {
        debug!("Cache write for {} failed: {}", key, e);
        false
      }
    }
  }

  /// Remove an entry. A missing key counts as success.
  pub async fn delete(&self, key: &str) -> bool {
    match self
      .blocking(key, |storage, key| storage.remove(&key))
      .await
    {
      Ok(()) => true,
      Err(e) => {
        debug!("Cache delete for {} failed: {}", key, e);
        false
      }
    }
  }

  /// Run one storage operation on the blocking pool.
  async fn blocking<R, F>(&self, key: &str, op: F) -> Result<R>
  where
    R: Send + 'static,
    F: FnOnce(&dyn KvStorage, String) -> Result<R> + Send + 'static,
  {
    let storage = Arc::clone(&self.storage);
    let key = key.to_string();
    tokio::task::spawn_blocking(move || op(storage.as_ref(), key))
      .await
      .map_err(|e| eyre!("Cache task failed: {}", e))?
  }
}

/// Serialize for storage: plain serde first, then the lossy fallback.
fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String> {
  match serde_json::to_string(value) {
    Ok(json) => Ok(json),
    Err(e) => {
      debug!("Falling back to lossy serialization: {}", e);
      let plain = lossy::to_value(value)
        .map_err(|e| eyre!("Failed to serialize cache value: {}", e))?;
      serde_json::to_string(&lossy::normalize_timestamps(plain))
        .map_err(|e| eyre!("Failed to serialize cache value: {}", e))
    }
  }
}

fn decode<T: DeserializeOwned>(key: &str, stored: StoredEntry) -> Option<CachedEntry<T>> {
  let value = match serde_json::from_str(&stored.value) {
    Ok(value) => value,
    Err(e) => {
      debug!("Cached value for {} has an unexpected shape: {}", key, e);
      return None;
    }
  };
  let cached_at = DateTime::from_timestamp_millis(stored.written_at)?;
  Some(CachedEntry { value, cached_at })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use serde::Deserialize;
  use serde_json::{json, Value};
  use std::collections::BTreeMap;

  const DAY_MS: i64 = 86_400_000;

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct PetRow {
    id: String,
    name: String,
  }

  fn cache() -> (tempfile::TempDir, Arc<ManualClock>, PersistentCache) {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::at(1_700_000_000_000));
    let storage = SqliteStorage::open(&dir.path().join("kv.db")).unwrap();
    let cache = PersistentCache::new(storage, clock.clone());
    (dir, clock, cache)
  }

  #[tokio::test]
  async fn test_set_then_get_returns_value() {
    let (_dir, _clock, cache) = cache();
    let value = json!({ "nested": [1, 2, { "x": "y" }], "flag": true });

    assert!(cache.set("k", &value).await);
    assert_eq!(cache.get::<Value>("k", None).await, Some(value));
  }

  #[tokio::test]
  async fn test_pets_scenario_expires_after_a_day() {
    let (_dir, clock, cache) = cache();
    let pets = vec![PetRow {
      id: "p1".into(),
      name: "Mochi".into(),
    }];
    let max_age = Some(Duration::milliseconds(DAY_MS));

    assert!(cache.set("pets:fam1", &pets).await);

    clock.advance(DAY_MS - 1);
    assert_eq!(cache.get::<Vec<PetRow>>("pets:fam1", max_age).await, Some(pets));

    clock.advance(2);
    assert_eq!(cache.get::<Vec<PetRow>>("pets:fam1", max_age).await, None);
  }

  #[tokio::test]
  async fn test_stale_read_deletes_entry() {
    let (_dir, clock, cache) = cache();
    let max_age = Duration::milliseconds(1_000);

    cache.set("k", &1).await;
    clock.advance(1_001);

    assert_eq!(cache.get::<i32>("k", Some(max_age)).await, None);
    assert_eq!(cache.get::<i32>("k", None).await, None);
  }

  #[tokio::test]
  async fn test_negative_max_age_disables_check() {
    let (_dir, clock, cache) = cache();
    cache.set("k", &1).await;
    clock.advance(10 * DAY_MS);

    assert_eq!(cache.get::<i32>("k", Some(Duration::milliseconds(-1))).await, Some(1));
  }

  #[tokio::test]
  async fn test_repeated_set_moves_timestamp_only() {
    let (_dir, clock, cache) = cache();

    cache.set("k", "v").await;
    let first = cache.get_entry::<String>("k", None).await.unwrap();
    clock.advance(5_000);
    cache.set("k", "v").await;
    let second = cache.get_entry::<String>("k", None).await.unwrap();

    assert_eq!(first.value, "v");
    assert_eq!(second.value, "v");
    assert_eq!(second.cached_at - first.cached_at, Duration::milliseconds(5_000));
  }

  #[tokio::test]
  async fn test_delete() {
    let (_dir, _clock, cache) = cache();
    cache.set("k", &1).await;

    assert!(cache.delete("k").await);
    assert!(cache.delete("k").await);
    assert_eq!(cache.get::<i32>("k", None).await, None);
  }

  #[tokio::test]
  async fn test_unserializable_value_uses_fallback() {
    let (_dir, _clock, cache) = cache();
    let mut map = BTreeMap::new();
    map.insert((2024, 1), json!({ "seconds": 10, "nanoseconds": 0 }));

    assert!(cache.set("weights", &map).await);
    assert_eq!(
      cache.get::<Value>("weights", None).await,
      Some(json!({ "[2024,1]": 10_000 }))
    );
  }

  #[tokio::test]
  async fn test_fallback_keeps_out_of_range_timestamps() {
    let (_dir, _clock, cache) = cache();
    let mut map = BTreeMap::new();
    map.insert((1, 2), json!({ "seconds": i64::MAX / 10, "nanoseconds": 0 }));

    assert!(cache.set("k", &map).await);
    assert_eq!(
      cache.get::<Value>("k", None).await,
      Some(json!({ "[1,2]": { "seconds": i64::MAX / 10, "nanoseconds": 0 } }))
    );
  }

  #[tokio::test]
  async fn test_shape_mismatch_is_a_miss() {
    let (_dir, _clock, cache) = cache();
    cache.set("k", "text").await;

    assert_eq!(cache.get::<Vec<PetRow>>("k", None).await, None);
  }

  #[tokio::test]
  async fn test_unavailable_cache_fails_open() {
    let cache = PersistentCache::unavailable();

    assert!(!cache.set("k", &1).await);
    assert!(!cache.delete("k").await);
    assert_eq!(cache.get::<i32>("k", None).await, None);
  }
}
