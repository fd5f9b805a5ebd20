//! Key/value storage trait and SQLite implementation.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Schema version stored in `PRAGMA user_version`.
const SCHEMA_VERSION: i64 = 1;

/// Schema for the key/value table.
const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    ts INTEGER NOT NULL
);
"#;

/// A raw record as persisted: JSON text plus its write time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
  pub value: String,
  /// Epoch millis at which the entry was written
  pub written_at: i64,
}

/// Trait for key/value storage backends.
///
/// Implementations are synchronous; callers run them on the blocking pool.
pub trait KvStorage: Send + Sync + 'static {
  /// Read an entry. When `max_age_ms` is given and the entry is older than that
  /// at `now`, the entry is deleted in the same transaction and `None` returned.
  fn read(&self, key: &str, max_age_ms: Option<i64>, now: i64) -> Result<Option<StoredEntry>>;

  /// Insert or fully replace an entry.
  fn write(&self, key: &str, value: &str, written_at: i64) -> Result<()>;

  /// Remove an entry. Removing a missing key succeeds.
  fn remove(&self, key: &str) -> Result<()>;
}

/// Storage used when no storage engine is available.
/// Reads miss and writes fail, which the cache above turns into no-ops.
pub struct UnavailableStorage;

impl KvStorage for UnavailableStorage {
  fn read(&self, _key: &str, _max_age_ms: Option<i64>, _now: i64) -> Result<Option<StoredEntry>> {
    Ok(None) // Always miss
  }

  fn write(&self, _key: &str, _value: &str, _written_at: i64) -> Result<()> {
    Err(eyre!("Cache storage is unavailable"))
  }

  fn remove(&self, _key: &str) -> Result<()> {
    Err(eyre!("Cache storage is unavailable"))
  }
}

/// SQLite-based key/value storage.
///
/// A connection is opened per operation and dropped when it returns, so the
/// handle is released on success, error, and rollback alike.
pub struct SqliteStorage {
  path: PathBuf,
}

impl SqliteStorage {
  /// Create storage at the given database path, creating parent directories.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let storage = Self {
      path: path.to_path_buf(),
    };
    // Fail early if the file cannot be opened at all
    storage.connect()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("meowlog").join("meow-log.db"))
  }

  fn connect(&self) -> Result<Connection> {
    let conn = Connection::open(&self.path).map_err(|e| {
      eyre!(
        "Failed to open cache database at {}: {}",
        self.path.display(),
        e
      )
    })?;

    conn
      .busy_timeout(Duration::from_secs(2))
      .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;

    run_migrations(&conn)?;
    Ok(conn)
  }
}

/// Bring the schema up to `SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<()> {
  let version: i64 = conn
    .query_row("PRAGMA user_version", [], |row| row.get(0))
    .map_err(|e| eyre!("Failed to read schema version: {}", e))?;

  if version < SCHEMA_VERSION {
    conn
      .execute_batch(KV_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;
    conn
      .pragma_update(None, "user_version", SCHEMA_VERSION)
      .map_err(|e| eyre!("Failed to record schema version: {}", e))?;
  }

  Ok(())
}

impl KvStorage for SqliteStorage {
  fn read(&self, key: &str, max_age_ms: Option<i64>, now: i64) -> Result<Option<StoredEntry>> {
    let mut conn = self.connect()?;
    let tx = conn
      .transaction_with_behavior(TransactionBehavior::Immediate)
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let entry = tx
      .query_row(
        "SELECT value, ts FROM kv WHERE key = ?",
        params![key],
        |row| {
          Ok(StoredEntry {
            value: row.get(0)?,
            written_at: row.get(1)?,
          })
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", key, e))?;

    let entry = match (entry, max_age_ms) {
      (Some(entry), Some(max_age)) if now - entry.written_at > max_age => {
        tx.execute("DELETE FROM kv WHERE key = ?", params![key])
          .map_err(|e| eyre!("Failed to delete stale entry {}: {}", key, e))?;
        None
      }
      (entry, _) => entry,
    };

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(entry)
  }

  fn write(&self, key: &str, value: &str, written_at: i64) -> Result<()> {
    let conn = self.connect()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO kv (key, value, ts) VALUES (?, ?, ?)",
        params![key, value, written_at],
      )
      .map_err(|e| eyre!("Failed to store cache entry {}: {}", key, e))?;
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let conn = self.connect()?;
    conn
      .execute("DELETE FROM kv WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete cache entry {}: {}", key, e))?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn storage() -> (tempfile::TempDir, SqliteStorage) {
    let dir = tempfile::tempdir().unwrap();
    let storage = SqliteStorage::open(&dir.path().join("nested").join("kv.db")).unwrap();
    (dir, storage)
  }

  #[test]
  fn test_write_then_read() {
    let (_dir, storage) = storage();
    storage.write("a", "[1,2]", 100).unwrap();

    let entry = storage.read("a", None, 5_000).unwrap().unwrap();
    assert_eq!(entry.value, "[1,2]");
    assert_eq!(entry.written_at, 100);
  }

  #[test]
  fn test_overwrite_replaces_value_and_timestamp() {
    let (_dir, storage) = storage();
    storage.write("a", "1", 100).unwrap();
    storage.write("a", "2", 200).unwrap();

    let entry = storage.read("a", None, 300).unwrap().unwrap();
    assert_eq!(
      entry,
      StoredEntry {
        value: "2".into(),
        written_at: 200
      }
    );
  }

  #[test]
  fn test_stale_read_deletes_entry() {
    let (_dir, storage) = storage();
    storage.write("a", "1", 1_000).unwrap();

    // Exactly at the boundary is still fresh
    assert!(storage.read("a", Some(500), 1_500).unwrap().is_some());
    assert!(storage.read("a", Some(500), 1_501).unwrap().is_none());
    // Gone for good, even without an age limit
    assert!(storage.read("a", None, 1_501).unwrap().is_none());
  }

  #[test]
  fn test_remove_missing_key_is_ok() {
    let (_dir, storage) = storage();
    storage.remove("nope").unwrap();
  }

  #[test]
  fn test_schema_version_recorded() {
    let (dir, _storage) = storage();
    let conn = Connection::open(dir.path().join("nested").join("kv.db")).unwrap();
    let version: i64 = conn
      .query_row("PRAGMA user_version", [], |row| row.get(0))
      .unwrap();
    assert_eq!(version, SCHEMA_VERSION);
  }

  #[test]
  fn test_unavailable_storage() {
    let storage = UnavailableStorage;
    assert!(storage.read("a", None, 0).unwrap().is_none());
    assert!(storage.write("a", "1", 0).is_err());
  }
}
