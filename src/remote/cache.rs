//! TTL cache for remote query results.

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::trace;

use super::query::{QueryOptions, QueryResponse};

/// Deterministic cache key for a query: `"{table}:{sha256 of the options}"`.
///
/// The table name is kept in clear so [`QueryCache::invalidate_table`] can
/// find every entry of a table by substring.
pub fn cache_key(table: &str, options: &QueryOptions) -> String {
  // QueryOptions serializes with sorted filter keys, so equal options hash equally
  let input = serde_json::to_string(options).unwrap_or_default();

  // SHA256 hash for stable, fixed-length keys
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  format!("{}:{}", table, hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: String,
  pub data: QueryResponse<Value>,
  pub timestamp: DateTime<Utc>,
  pub ttl: TimeDelta,
}

impl CacheEntry {
  fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
    now - self.timestamp <= self.ttl
  }
}

/// In-memory query cache owned by one [`super::RemoteQueryLayer`].
#[derive(Default)]
pub struct QueryCache {
  entries: Mutex<HashMap<String, CacheEntry>>,
  /// Bumped by every invalidation and clear, under the entries lock
  generation: AtomicU64,
}

impl QueryCache {
  pub fn new() -> Self {
    Self::default()
  }

  /// A valid entry for `key`. An expired entry is evicted and reported as absent.
  pub fn get(&self, key: &str) -> Option<QueryResponse<Value>> {
    let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
    let entry = entries.get(key)?;
    if entry.is_valid_at(Utc::now()) {
      return Some(entry.data.clone());
    }

    trace!(key, "evicting expired cache entry");
    entries.remove(key);
    None
  }

  /// Current invalidation generation. Take it before a fetch and hand it to
  /// [`Self::insert_if_unchanged`] when writing the result back.
  pub fn generation(&self) -> u64 {
    self.generation.load(Ordering::Acquire)
  }

  fn entry(key: &str, data: QueryResponse<Value>, ttl: Duration) -> CacheEntry {
    CacheEntry {
      key: key.to_string(),
      data,
      timestamp: Utc::now(),
      ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
    }
  }

  pub fn insert(&self, key: String, data: QueryResponse<Value>, ttl: Duration) {
    let entry = Self::entry(&key, data, ttl);
    self
      .entries
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(key, entry);
  }

  /// Insert only if nothing was invalidated since `generation` was read.
  ///
  /// A page fetched while a write invalidated the cache may predate that
  /// write; it is dropped rather than served for a whole ttl.
  pub fn insert_if_unchanged(
    &self,
    key: String,
    data: QueryResponse<Value>,
    ttl: Duration,
    generation: u64,
  ) -> bool {
    let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
    if self.generation.load(Ordering::Acquire) != generation {
      trace!(key = %key, "skipping write-back of a page fetched across an invalidation");
      return false;
    }
    let entry = Self::entry(&key, data, ttl);
    entries.insert(key, entry);
    true
  }

  /// Evict every entry whose key contains `table`.
  ///
  /// Substring matching evicts a superset of the affected entries (a table
  /// named `tool` also clears `tools` entries). Never a subset.
  pub fn invalidate_table(&self, table: &str) -> usize {
    let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
    self.generation.fetch_add(1, Ordering::AcqRel);
    let before = entries.len();
    entries.retain(|key, _| !key.contains(table));
    before - entries.len()
  }

  pub fn clear(&self) {
    let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
    self.generation.fetch_add(1, Ordering::AcqRel);
    entries.clear();
  }

  pub fn len(&self) -> usize {
    self
      .entries
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn contains_key(&self, key: &str) -> bool {
    self
      .entries
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .contains_key(key)
  }
}
