//! Persisted-tier storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;

/// A serialized cache entry as it lives in the persisted tier.
#[derive(Debug, Clone)]
pub struct PersistedEntry {
  /// Serialized (optionally compressed) value bytes
  pub payload: Vec<u8>,
  pub compressed: bool,
  pub fetched_at: DateTime<Utc>,
  pub fresh_until: DateTime<Utc>,
  pub stale_until: DateTime<Utc>,
}

/// Trait for persisted cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Store an entry under (namespace, key), overwriting any prior entry.
  fn put(&self, namespace: &str, key: &str, entry: &PersistedEntry) -> Result<()>;

  /// Load an entry by (namespace, key).
  fn get(&self, namespace: &str, key: &str) -> Result<Option<PersistedEntry>>;

  /// Remove an entry. Removing a missing entry is not an error.
  fn remove(&self, namespace: &str, key: &str) -> Result<()>;

  /// Remove every entry in a namespace.
  fn clear(&self, namespace: &str) -> Result<()>;
}

/// Storage implementation that doesn't persist anything.
/// Used for memory-only caches - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn put(&self, _namespace: &str, _key: &str, _entry: &PersistedEntry) -> Result<()> {
    Ok(())
  }

  fn get(&self, _namespace: &str, _key: &str) -> Result<Option<PersistedEntry>> {
    Ok(None)
  }

  fn remove(&self, _namespace: &str, _key: &str) -> Result<()> {
    Ok(())
  }

  fn clear(&self, _namespace: &str) -> Result<()> {
    Ok(())
  }
}

/// Schema for the persisted cache tier.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    namespace TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    key_desc TEXT NOT NULL,
    payload BLOB NOT NULL,
    compressed INTEGER NOT NULL DEFAULT 0,
    fetched_at TEXT NOT NULL,
    fresh_until TEXT NOT NULL,
    stale_until TEXT NOT NULL,
    PRIMARY KEY (namespace, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_stale
    ON cache_entries(namespace, stale_until);
"#;

/// SQLite-based persisted tier.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open or create the database at the default location
  /// (`$XDG_DATA_HOME/tripsync/cache.db`).
  pub fn open() -> Result<Self> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Self::open_at(&data_dir.join("tripsync").join("cache.db"))
  }

  /// Open or create the database at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

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

  /// SHA256 hash for stable, fixed-length storage keys.
  fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl CacheStorage for SqliteStorage {
  fn put(&self, namespace: &str, key: &str, entry: &PersistedEntry) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries
           (namespace, key_hash, key_desc, payload, compressed, fetched_at, fresh_until, stale_until)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          namespace,
          Self::hash_key(key),
          key,
          entry.payload,
          entry.compressed as i64,
          entry.fetched_at.to_rfc3339(),
          entry.fresh_until.to_rfc3339(),
          entry.stale_until.to_rfc3339(),
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  fn get(&self, namespace: &str, key: &str) -> Result<Option<PersistedEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(Vec<u8>, i64, String, String, String)> = conn
      .query_row(
        "SELECT payload, compressed, fetched_at, fresh_until, stale_until
         FROM cache_entries WHERE namespace = ? AND key_hash = ?",
        params![namespace, Self::hash_key(key)],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    let (payload, compressed, fetched_at, fresh_until, stale_until) = match row {
      Some(row) => row,
      None => return Ok(None),
    };

    Ok(Some(PersistedEntry {
      payload,
      compressed: compressed != 0,
      fetched_at: parse_datetime(&fetched_at)?,
      fresh_until: parse_datetime(&fresh_until)?,
      stale_until: parse_datetime(&stale_until)?,
    }))
  }

  fn remove(&self, namespace: &str, key: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM cache_entries WHERE namespace = ? AND key_hash = ?",
        params![namespace, Self::hash_key(key)],
      )
      .map_err(|e| eyre!("Failed to remove cache entry: {}", e))?;

    Ok(())
  }

  fn clear(&self, namespace: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM cache_entries WHERE namespace = ?",
        params![namespace],
      )
      .map_err(|e| eyre!("Failed to clear cache namespace: {}", e))?;

    Ok(())
  }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
