//! Key-value backend trait with SQLite and in-memory implementations.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::StorageError;

type Result<T> = std::result::Result<T, StorageError>;

/// Trait for durable string key-value storage.
pub trait KeyValueBackend: Send + Sync {
  /// Read the raw value under `key`.
  fn get(&self, key: &str) -> Result<Option<String>>;

  /// Insert or replace the value under `key`.
  fn set(&self, key: &str, value: &str) -> Result<()>;

  /// Remove `key`. Removing a missing key is not an error.
  fn remove(&self, key: &str) -> Result<()>;

  /// All keys starting with `prefix`, with their values.
  fn entries(&self, prefix: &str) -> Result<Vec<(String, String)>>;
}

/// Backend that keeps everything in process memory.
/// Used in tests and when no data directory is available.
#[derive(Default)]
pub struct MemoryBackend {
  values: Mutex<BTreeMap<String, String>>,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self::default()
  }
}

impl KeyValueBackend for MemoryBackend {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let values = self.values.lock().map_err(|_| StorageError::LockPoisoned)?;
    Ok(values.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    let mut values = self.values.lock().map_err(|_| StorageError::LockPoisoned)?;
    values.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let mut values = self.values.lock().map_err(|_| StorageError::LockPoisoned)?;
    values.remove(key);
    Ok(())
  }

  fn entries(&self, prefix: &str) -> Result<Vec<(String, String)>> {
    let values = self.values.lock().map_err(|_| StorageError::LockPoisoned)?;
    Ok(
      values
        .iter()
        .filter(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect(),
    )
  }
}

/// SQLite-based key-value storage.
pub struct SqliteBackend {
  conn: Mutex<Connection>,
}

impl SqliteBackend {
  /// Open the store at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open or create the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    let backend = Self {
      conn: Mutex::new(conn),
    };
    backend.run_migrations()?;

    Ok(backend)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| {
        std::io::Error::new(
          std::io::ErrorKind::NotFound,
          "could not determine data directory",
        )
      })?;

    Ok(data_dir.join("catalog-sync").join("store.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
    conn.execute_batch(STORE_SCHEMA)?;
    Ok(())
  }
}

/// Schema for the key-value table.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl KeyValueBackend for SqliteBackend {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
    let value = conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
    conn.execute(
      "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?, ?, datetime('now'))",
      params![key, value],
    )?;
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
    conn.execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
    Ok(())
  }

  fn entries(&self, prefix: &str) -> Result<Vec<(String, String)>> {
    let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
    // LIKE would treat `_` in prefixes as a wildcard and ignore case
    let mut stmt = conn.prepare(
      "SELECT key, value FROM kv_store WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
    )?;
    let rows = stmt
      .query_map(params![prefix], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
  }
}
