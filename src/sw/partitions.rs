//! Named response-cache partitions (the worker's `caches`), stored in SQLite.

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use super::request::Response;
use crate::clock::{Clock, SystemClock};

/// Eviction policy of a partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Expiration {
  /// Keep at most this many entries, dropping the oldest insertions first
  pub max_entries: Option<usize>,
  /// Entries older than this are treated as absent
  pub max_age: Option<Duration>,
}

impl Expiration {
  pub fn new(max_entries: usize, max_age: Duration) -> Self {
    Self {
      max_entries: Some(max_entries),
      max_age: Some(max_age),
    }
  }

  fn cutoff(&self, now: i64) -> Option<i64> {
    self.max_age.map(|age| now - age.num_milliseconds())
  }
}

/// Schema for the partition tables.
const PARTITION_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_names (
    name TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS response_cache (
    partition TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at INTEGER NOT NULL,
    seq INTEGER NOT NULL,
    PRIMARY KEY (partition, url)
);

CREATE INDEX IF NOT EXISTS idx_response_cache_seq
    ON response_cache(partition, seq);
"#;

/// All response partitions of the worker.
///
/// SQLite work runs on the blocking pool. One connection is shared behind a
/// mutex, so a put or match on a key is atomic with respect to every other
/// request.
#[derive(Clone)]
pub struct ResponseCache {
  db: Arc<PartitionDb>,
}

struct PartitionDb {
  conn: Mutex<Connection>,
  clock: Arc<dyn Clock>,
}

impl ResponseCache {
  /// Open the partition store at `path`, creating parent directories.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open response cache at {}: {}", path.display(), e))?;

    Self::with_connection(conn, Arc::new(SystemClock))
  }

  /// A throwaway in-memory store.
  #[cfg(test)]
  pub fn in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory response cache: {}", e))?;
    Self::with_connection(conn, clock)
  }

  fn with_connection(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self> {
    conn
      .execute_batch(PARTITION_SCHEMA)
      .map_err(|e| eyre!("Failed to run response cache migrations: {}", e))?;

    Ok(Self {
      db: Arc::new(PartitionDb {
        conn: Mutex::new(conn),
        clock,
      }),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("meowlog").join("meow-log-sw.db"))
  }

  /// Run one database operation on the blocking pool.
  async fn blocking<R, F>(&self, op: F) -> Result<R>
  where
    R: Send + 'static,
    F: FnOnce(&PartitionDb) -> Result<R> + Send + 'static,
  {
    let db = Arc::clone(&self.db);
    tokio::task::spawn_blocking(move || op(&db))
      .await
      .map_err(|e| eyre!("Response cache task failed: {}", e))?
  }

  /// Create a partition if it does not exist yet.
  pub async fn open_partition(&self, name: &str) -> Result<()> {
    let name = name.to_string();
    self.blocking(move |db| db.open_partition(&name)).await
  }

  /// Names of all existing partitions.
  pub async fn partition_names(&self) -> Result<Vec<String>> {
    self.blocking(|db| db.partition_names()).await
  }

  /// Delete a partition and everything in it. Returns whether it existed.
  pub async fn delete_partition(&self, name: &str) -> Result<bool> {
    let name = name.to_string();
    self.blocking(move |db| db.delete_partition(&name)).await
  }

  /// Store a response under `url`, replacing any previous one, then apply the
  /// partition's expiration.
  pub async fn put(&self, partition: &str, url: &str, response: &Response, expiration: &Expiration) -> Result<()> {
    let (partition, url, response, expiration) =
      (partition.to_string(), url.to_string(), response.clone(), *expiration);
    self
      .blocking(move |db| db.put(&partition, &url, &response, &expiration))
      .await
  }

  /// Look up `url`. Expired entries are removed and reported as a miss.
  pub async fn match_url(&self, partition: &str, url: &str, expiration: &Expiration) -> Result<Option<Response>> {
    let (partition, url, expiration) = (partition.to_string(), url.to_string(), *expiration);
    self
      .blocking(move |db| db.match_url(&partition, &url, &expiration))
      .await
  }

  /// Number of entries in a partition.
  #[cfg(test)]
  pub async fn len(&self, partition: &str) -> Result<usize> {
    let partition = partition.to_string();
    self.blocking(move |db| db.len(&partition)).await
  }
}

impl PartitionDb {
  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Create a partition if it does not exist yet.
  fn open_partition(&self, name: &str) -> Result<()> {
    self
      .lock()?
      .execute(
        "INSERT OR IGNORE INTO cache_names (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to create partition {}: {}", name, e))?;
    Ok(())
  }

  /// Names of all existing partitions.
  fn partition_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_names ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partition name: {}", e))?;
    Ok(names)
  }

  /// Delete a partition and everything in it. Returns whether it existed.
  fn delete_partition(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM response_cache WHERE partition = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM cache_names WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(removed > 0)
  }

  /// Store a response under `url`, replacing any previous one, then apply the
  /// partition's expiration.
  fn put(&self, partition: &str, url: &str, response: &Response, expiration: &Expiration) -> Result<()> {
    let now = self.clock.now_millis();
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_names (name) VALUES (?)",
      params![partition],
    )
    .map_err(|e| eyre!("Failed to create partition {}: {}", partition, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO response_cache (partition, url, status, headers, body, cached_at, seq)
       VALUES (?, ?, ?, ?, ?, ?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM response_cache))",
      params![partition, url, response.status, headers, response.body, now],
    )
    .map_err(|e| eyre!("Failed to store {} in {}: {}", url, partition, e))?;

    if let Some(cutoff) = expiration.cutoff(now) {
      let purged = tx
        .execute(
          "DELETE FROM response_cache WHERE partition = ? AND cached_at < ?",
          params![partition, cutoff],
        )
        .map_err(|e| eyre!("Failed to purge expired entries of {}: {}", partition, e))?;
      if purged > 0 {
        debug!("Purged {} expired entries from {}", purged, partition);
      }
    }

    if let Some(max_entries) = expiration.max_entries {
      let evicted = tx
        .execute(
          "DELETE FROM response_cache WHERE partition = ?1 AND seq NOT IN (
             SELECT seq FROM response_cache WHERE partition = ?1 ORDER BY seq DESC LIMIT ?2
           )",
          params![partition, max_entries as i64],
        )
        .map_err(|e| eyre!("Failed to evict entries of {}: {}", partition, e))?;
      if evicted > 0 {
        debug!("Evicted {} entries from {}", evicted, partition);
      }
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  /// Look up `url`. Expired entries are removed and reported as a miss.
  fn match_url(&self, partition: &str, url: &str, expiration: &Expiration) -> Result<Option<Response>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>, i64)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM response_cache
         WHERE partition = ? AND url = ?",
        params![partition, url],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {} in {}: {}", url, partition, e))?;

    let Some((status, headers, body, cached_at)) = row else {
      return Ok(None);
    };

    if let Some(cutoff) = expiration.cutoff(self.clock.now_millis()) {
      if cached_at < cutoff {
        conn
          .execute(
            "DELETE FROM response_cache WHERE partition = ? AND url = ?",
            params![partition, url],
          )
          .map_err(|e| eyre!("Failed to delete expired {}: {}", url, e))?;
        return Ok(None);
      }
    }

    let headers = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to parse cached headers for {}: {}", url, e))?;
    Ok(Some(Response {
      status,
      headers,
      body,
    }))
  }

  #[cfg(test)]
  fn len(&self, partition: &str) -> Result<usize> {
    let count: i64 = self
      .lock()?
      .query_row(
        "SELECT COUNT(*) FROM response_cache WHERE partition = ?",
        params![partition],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", partition, e))?;
    Ok(count as usize)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;

  fn cache() -> (Arc<ManualClock>, ResponseCache) {
    let clock = Arc::new(ManualClock::at(1_000_000));
    let cache = ResponseCache::in_memory(clock.clone()).unwrap();
    (clock, cache)
  }

  #[tokio::test]
  async fn test_put_then_match() {
    let (_clock, cache) = cache();
    let mut response = Response::ok("body");
    response.headers.push(("content-type".into(), "text/css".into()));

    cache.put("p", "/a.css", &response, &Expiration::default()).await.unwrap();
    assert_eq!(
      cache.match_url("p", "/a.css", &Expiration::default()).await.unwrap(),
      Some(response)
    );
    assert_eq!(cache.match_url("other", "/a.css", &Expiration::default()).await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_max_entries_evicts_oldest_insert() {
    let (_clock, cache) = cache();
    let policy = Expiration {
      max_entries: Some(2),
      max_age: None,
    };

    for url in ["/1", "/2", "/3"] {
      cache.put("p", url, &Response::ok(url), &policy).await.unwrap();
    }

    assert_eq!(cache.len("p").await.unwrap(), 2);
    assert!(cache.match_url("p", "/1", &policy).await.unwrap().is_none());
    assert!(cache.match_url("p", "/3", &policy).await.unwrap().is_some());
  }

  #[tokio::test]
  async fn test_overwrite_refreshes_insertion_order() {
    let (_clock, cache) = cache();
    let policy = Expiration {
      max_entries: Some(2),
      max_age: None,
    };

    cache.put("p", "/1", &Response::ok("a"), &policy).await.unwrap();
    cache.put("p", "/2", &Response::ok("b"), &policy).await.unwrap();
    cache.put("p", "/1", &Response::ok("c"), &policy).await.unwrap();
    cache.put("p", "/3", &Response::ok("d"), &policy).await.unwrap();

    assert!(cache.match_url("p", "/2", &policy).await.unwrap().is_none());
    assert_eq!(
      cache.match_url("p", "/1", &policy).await.unwrap().unwrap().body,
      b"c".to_vec()
    );
  }

  #[tokio::test]
  async fn test_eviction_is_per_partition() {
    let (_clock, cache) = cache();
    let policy = Expiration {
      max_entries: Some(1),
      max_age: None,
    };

    cache.put("a", "/1", &Response::ok("a"), &policy).await.unwrap();
    cache.put("b", "/1", &Response::ok("b"), &policy).await.unwrap();

    assert_eq!(cache.len("a").await.unwrap(), 1);
    assert_eq!(cache.len("b").await.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_max_age_hides_and_purges() {
    let (clock, cache) = cache();
    let policy = Expiration {
      max_entries: None,
      max_age: Some(Duration::seconds(10)),
    };

    cache.put("p", "/old", &Response::ok("x"), &policy).await.unwrap();
    clock.advance(11_000);

    assert!(cache.match_url("p", "/old", &policy).await.unwrap().is_none());
    assert_eq!(cache.len("p").await.unwrap(), 0);
    // Without an age limit the entry would have been served
    cache.put("p", "/old", &Response::ok("x"), &policy).await.unwrap();
    clock.advance(11_000);
    assert!(cache
      .match_url("p", "/old", &Expiration::default())
      .await
      .unwrap()
      .is_some());
  }

  #[tokio::test]
  async fn test_partition_lifecycle() {
    let (_clock, cache) = cache();
    cache.open_partition("empty").await.unwrap();
    cache
      .put("full", "/x", &Response::ok("x"), &Expiration::default())
      .await
      .unwrap();

    assert_eq!(cache.partition_names().await.unwrap(), vec!["empty", "full"]);
    assert!(cache.delete_partition("full").await.unwrap());
    assert!(!cache.delete_partition("full").await.unwrap());
    assert_eq!(cache.len("full").await.unwrap(), 0);
    assert_eq!(cache.partition_names().await.unwrap(), vec!["empty"]);
  }
}
