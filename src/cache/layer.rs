//! Cache layer that orchestrates caching logic with remote fetching.

use chrono::Duration;
use color_eyre::Result;
use std::future::Future;
use tracing::{debug, warn};

use super::persistent::PersistentCache;
use super::traits::{CacheResult, Cacheable};

/// Options for a single read through the cache.
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
  /// Entries older than this are stale. `None` accepts any age.
  pub max_age: Option<Duration>,
  /// Skip the cache and go straight to the remote source
  pub force_refresh: bool,
}

impl ReadOptions {
  pub fn max_age(max_age: Duration) -> Self {
    Self {
      max_age: Some(max_age),
      force_refresh: false,
    }
  }

  pub fn refresh(mut self, force_refresh: bool) -> Self {
    self.force_refresh = force_refresh;
    self
  }
}

/// Cache-aside accessor in front of a remote source.
///
/// This layer sits between the data stores and the remote client,
/// providing transparent caching with offline support.
#[derive(Clone)]
pub struct CacheLayer {
  cache: PersistentCache,
}

impl CacheLayer {
  pub fn new(cache: PersistentCache) -> Self {
    Self { cache }
  }

  /// The underlying persistent cache.
  pub fn cache(&self) -> &PersistentCache {
    &self.cache
  }

  /// Fetch a value with a stale-while-revalidate strategy.
  ///
  /// 1. With `force_refresh`, go straight to the remote
  /// 2. A fresh, non-blank cache hit is returned immediately and the remote is
  ///    called in a detached background task that only refreshes the cache
  /// 3. Otherwise await the remote and cache the result
  /// 4. On remote failure return `last_known` if it is not blank, else the
  ///    default value; the error itself is logged and absorbed
  pub async fn fetch<T, F, Fut>(
    &self,
    key: &str,
    options: ReadOptions,
    last_known: T,
    fetcher: F,
  ) -> CacheResult<T>
  where
    T: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    if !options.force_refresh {
      if let Some(cached) = self.cache.get_entry::<T>(key, options.max_age).await {
        if !cached.value.is_blank() {
          debug!("Cache hit for {}", key);
          self.revalidate_in_background(key, fetcher());
          return CacheResult::from_cache(cached.value, cached.cached_at);
        }
        debug!("Cached value for {} is blank, fetching", key);
      }
    }

    match fetcher().await {
      Ok(data) => {
        self.cache.set(key, &data).await;
        CacheResult::from_network(data)
      }
      Err(e) => {
        warn!("Remote fetch for {} failed: {}", key, e);
        if last_known.is_blank() {
          CacheResult::empty(T::default())
        } else {
          CacheResult::offline(last_known)
        }
      }
    }
  }

  /// Read only the cache, without touching the remote.
  pub async fn peek<T: Cacheable>(&self, key: &str, max_age: Option<Duration>) -> Option<T> {
    self
      .cache
      .get::<T>(key, max_age)
      .await
      .filter(|value| !value.is_blank())
  }

  /// Overwrite the cached value after a local mutation.
  pub async fn store<T: Cacheable>(&self, key: &str, value: &T) -> bool {
    self.cache.set(key, value).await
  }

  /// Drop the cached value for `key`.
  pub async fn invalidate(&self, key: &str) -> bool {
    self.cache.delete(key).await
  }

  /// Spawn the refresh as a detached task whose outcome only lands in the
  /// cache. If the runtime shuts down first the refresh is abandoned.
  fn revalidate_in_background<T, Fut>(&self, key: &str, refresh: Fut)
  where
    T: Cacheable,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let cache = self.cache.clone();
    let key = key.to_string();

    tokio::spawn(async move {
      match refresh.await {
        Ok(data) => {
          cache.set(&key, &data).await;
          debug!("Revalidated {}", key);
        }
        Err(e) => debug!("Background refresh of {} failed: {}", key, e),
      }
    });
  }
}
