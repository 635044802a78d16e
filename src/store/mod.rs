//! Persistent local store.
//!
//! Holds the cached entity lists, user preferences, the offline action queue
//! and the last-sync timestamp under namespaced keys, each as a JSON value.
//! Every failure of the underlying backend is logged and masked behind a safe
//! default: reads yield empty/`None`, writes become no-ops. Callers never see
//! a storage error.

mod backend;

pub use backend::{KeyValueBackend, MemoryBackend, SqliteBackend};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

use crate::model::{CatalogEntity, EntityKind, PreferencesPatch, UserPreferences};
use crate::queue::{ActionOp, OfflineAction};

/// Capacity assumed when estimating storage usage.
pub const DEFAULT_CAPACITY_BYTES: u64 = 5 * 1024 * 1024;

const KEY_PREFIX: &str = "catalog_sync:";

/// Namespaced keys of the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKey {
  Entities(EntityKind),
  Preferences,
  OfflineQueue,
  LastSync,
  AppConfig,
}

impl StoreKey {
  pub const ALL: [StoreKey; 6] = [
    StoreKey::Entities(EntityKind::Tool),
    StoreKey::Entities(EntityKind::Category),
    StoreKey::Preferences,
    StoreKey::OfflineQueue,
    StoreKey::LastSync,
    StoreKey::AppConfig,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      StoreKey::Entities(EntityKind::Tool) => "catalog_sync:tools",
      StoreKey::Entities(EntityKind::Category) => "catalog_sync:categories",
      StoreKey::Preferences => "catalog_sync:preferences",
      StoreKey::OfflineQueue => "catalog_sync:offline_queue",
      StoreKey::LastSync => "catalog_sync:last_sync",
      StoreKey::AppConfig => "catalog_sync:app_config",
    }
  }
}

/// Local app metadata kept next to the catalog data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
  pub last_export_time: Option<DateTime<Utc>>,
}

/// Estimated storage usage against the configured capacity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StorageUsage {
  pub used: u64,
  pub total: u64,
  pub percentage: f64,
}

struct Inner {
  backend: Box<dyn KeyValueBackend>,
  capacity: u64,
  /// Serializes read-modify-write of the queue
  queue_lock: Mutex<()>,
}

/// Key-addressed store over a [`KeyValueBackend`]. Cheap to clone.
#[derive(Clone)]
pub struct LocalStore {
  inner: Arc<Inner>,
}

impl LocalStore {
  pub fn new(backend: impl KeyValueBackend + 'static) -> Self {
    Self::with_capacity(backend, DEFAULT_CAPACITY_BYTES)
  }

  pub fn with_capacity(backend: impl KeyValueBackend + 'static, capacity: u64) -> Self {
    Self {
      inner: Arc::new(Inner {
        backend: Box::new(backend),
        capacity,
        queue_lock: Mutex::new(()),
      }),
    }
  }

  /// A store that lives only as long as the process.
  pub fn in_memory() -> Self {
    Self::new(MemoryBackend::new())
  }

  fn read<T: DeserializeOwned>(&self, key: StoreKey) -> Option<T> {
    let raw = match self.inner.backend.get(key.as_str()) {
      Ok(raw) => raw?,
      Err(e) => {
        warn!(key = key.as_str(), error = %e, "failed to read local store");
        return None;
      }
    };

    match serde_json::from_str(&raw) {
      Ok(value) => Some(value),
      Err(e) => {
        warn!(key = key.as_str(), error = %e, "discarding unparsable local store value");
        None
      }
    }
  }

  fn write<T: Serialize + ?Sized>(&self, key: StoreKey, value: &T) {
    let raw = match serde_json::to_string(value) {
      Ok(raw) => raw,
      Err(e) => {
        warn!(key = key.as_str(), error = %e, "failed to serialize local store value");
        return;
      }
    };

    if let Err(e) = self.inner.backend.set(key.as_str(), &raw) {
      warn!(key = key.as_str(), error = %e, "failed to write local store");
    }
  }

  fn remove(&self, key: StoreKey) {
    if let Err(e) = self.inner.backend.remove(key.as_str()) {
      warn!(key = key.as_str(), error = %e, "failed to remove local store key");
    }
  }

  /// Cached entities of kind `E`.
  pub fn get_entities<E: CatalogEntity>(&self) -> Vec<E> {
    self.read(StoreKey::Entities(E::KIND)).unwrap_or_default()
  }

  /// Replace the cached entities of kind `E`.
  pub fn save_entities<E: CatalogEntity>(&self, entities: &[E]) {
    self.write(StoreKey::Entities(E::KIND), entities);
  }

  /// Stored preferences merged over defaults.
  pub fn get_preferences(&self) -> UserPreferences {
    self.read(StoreKey::Preferences).unwrap_or_default()
  }

  /// Apply `patch` to the stored preferences and persist. Returns the result.
  pub fn save_preferences(&self, patch: PreferencesPatch) -> UserPreferences {
    let mut prefs = self.get_preferences();
    prefs.apply(patch);
    self.write(StoreKey::Preferences, &prefs);
    prefs
  }

  pub(crate) fn replace_preferences(&self, prefs: &UserPreferences) {
    self.write(StoreKey::Preferences, prefs);
  }

  /// The offline action queue, oldest first.
  pub fn get_queue(&self) -> Vec<OfflineAction> {
    self.read(StoreKey::OfflineQueue).unwrap_or_default()
  }

  /// Stamp `op` with an id and timestamp and append it to the queue.
  ///
  /// Returns the stored action, or `None` if it could not be persisted.
  pub fn append_action(&self, op: ActionOp) -> Option<OfflineAction> {
    let _guard = self
      .inner
      .queue_lock
      .lock()
      .unwrap_or_else(PoisonError::into_inner);

    let mut queue = self.get_queue();
    let action = OfflineAction::new(op);
    queue.push(action.clone());

    let raw = match serde_json::to_string(&queue) {
      Ok(raw) => raw,
      Err(e) => {
        warn!(error = %e, "failed to serialize offline queue");
        return None;
      }
    };
    match self.inner.backend.set(StoreKey::OfflineQueue.as_str(), &raw) {
      Ok(()) => {
        debug!(
          action_id = %action.id,
          entity = action.op.kind().tag(),
          action = action.op.action_name(),
          queue_len = queue.len(),
          "queued offline action"
        );
        Some(action)
      }
      Err(e) => {
        warn!(error = %e, "failed to persist offline queue");
        None
      }
    }
  }

  /// Drop the actions whose ids are in `ids` and return what is left.
  ///
  /// Actions appended after `ids` was taken are kept.
  pub fn remove_actions(&self, ids: &HashSet<String>) -> Vec<OfflineAction> {
    let _guard = self
      .inner
      .queue_lock
      .lock()
      .unwrap_or_else(PoisonError::into_inner);

    let remaining: Vec<OfflineAction> = self
      .get_queue()
      .into_iter()
      .filter(|action| !ids.contains(&action.id))
      .collect();
    if remaining.is_empty() {
      self.remove(StoreKey::OfflineQueue);
    } else {
      self.write(StoreKey::OfflineQueue, &remaining);
    }
    remaining
  }

  pub fn clear_queue(&self) {
    let _guard = self
      .inner
      .queue_lock
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    self.remove(StoreKey::OfflineQueue);
  }

  pub fn get_last_sync_time(&self) -> Option<DateTime<Utc>> {
    self.read(StoreKey::LastSync)
  }

  pub fn set_last_sync_time(&self, time: DateTime<Utc>) {
    self.write(StoreKey::LastSync, &time);
  }

  pub fn get_app_config(&self) -> AppConfig {
    self.read(StoreKey::AppConfig).unwrap_or_default()
  }

  pub fn save_app_config(&self, config: &AppConfig) {
    self.write(StoreKey::AppConfig, config);
  }

  /// Remove every key owned by the store.
  pub fn clear_all(&self) {
    let _guard = self
      .inner
      .queue_lock
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    for key in StoreKey::ALL {
      self.remove(key);
    }
  }

  /// Bytes used by namespaced keys and values against the configured capacity.
  pub fn get_storage_usage(&self) -> StorageUsage {
    let total = self.inner.capacity;
    let used = match self.inner.backend.entries(KEY_PREFIX) {
      Ok(entries) => entries
        .iter()
        .map(|(k, v)| (k.len() + v.len()) as u64)
        .sum(),
      Err(e) => {
        warn!(error = %e, "failed to estimate storage usage");
        0
      }
    };
    let percentage = if total == 0 {
      0.0
    } else {
      used as f64 / total as f64 * 100.0
    };

    StorageUsage {
      used,
      total,
      percentage,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::StorageError;
  use crate::model::{Category, Theme, Tool};
  use crate::queue::{EntityRef, Mutation};

  /// Backend whose every call fails.
  struct BrokenBackend;

  impl KeyValueBackend for BrokenBackend {
    fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
      Err(StorageError::LockPoisoned)
    }

    fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
      Err(StorageError::LockPoisoned)
    }

    fn remove(&self, _key: &str) -> Result<(), StorageError> {
      Err(StorageError::LockPoisoned)
    }

    fn entries(&self, _prefix: &str) -> Result<Vec<(String, String)>, StorageError> {
      Err(StorageError::LockPoisoned)
    }
  }

  #[test]
  fn test_empty_store_usage_is_zero() {
    let store = LocalStore::in_memory();
    let usage = store.get_storage_usage();
    assert_eq!(usage.used, 0);
    assert_eq!(usage.percentage, 0.0);
    assert_eq!(usage.total, DEFAULT_CAPACITY_BYTES);
  }

  #[test]
  fn test_usage_grows_with_data() {
    let store = LocalStore::with_capacity(MemoryBackend::new(), 1000);
    store.save_entities(&[Tool::new("ripgrep")]);
    let usage = store.get_storage_usage();
    assert!(usage.used > 0);
    assert!(usage.percentage > 0.0);
  }

  #[test]
  fn test_entities_are_kept_per_kind() {
    let store = LocalStore::in_memory();
    store.save_entities(&[Tool::new("a"), Tool::new("b")]);
    store.save_entities(&[Category::new("c")]);

    assert_eq!(store.get_entities::<Tool>().len(), 2);
    assert_eq!(store.get_entities::<Category>().len(), 1);
  }

  #[test]
  fn test_append_assigns_ids_in_order() {
    let store = LocalStore::in_memory();
    let tool = Tool::new("fd");
    store.append_action(ActionOp::Tool(Mutation::Create(tool.clone())));
    store.append_action(ActionOp::Tool(Mutation::Update(tool.clone())));
    store.append_action(ActionOp::Tool(Mutation::Delete(EntityRef::of(&tool))));

    let queue = store.get_queue();
    assert_eq!(queue.len(), 3);
    assert_eq!(queue[0].op.action_name(), "create");
    assert_eq!(queue[1].op.action_name(), "update");
    assert_eq!(queue[2].op.action_name(), "delete");
    assert!(queue[0].id < queue[1].id && queue[1].id < queue[2].id);

    store.clear_queue();
    assert!(store.get_queue().is_empty());
  }

  #[test]
  fn test_remove_actions_keeps_later_appends() {
    let store = LocalStore::in_memory();
    let first = store
      .append_action(ActionOp::Tool(Mutation::Create(Tool::new("a"))))
      .unwrap();
    let drained: HashSet<String> = [first.id.clone()].into_iter().collect();
    let late = store
      .append_action(ActionOp::Category(Mutation::Create(Category::new("b"))))
      .unwrap();

    let remaining = store.remove_actions(&drained);
    assert_eq!(remaining, vec![late.clone()]);
    assert_eq!(store.get_queue(), vec![late.clone()]);

    let all: HashSet<String> = [late.id].into_iter().collect();
    assert!(store.remove_actions(&all).is_empty());
    assert_eq!(store.get_storage_usage().used, 0);
  }

  #[test]
  fn test_preferences_merge_and_persist() {
    let store = LocalStore::in_memory();
    assert_eq!(store.get_preferences(), UserPreferences::default());

    store.save_preferences(PreferencesPatch {
      theme: Some(Theme::Dark),
      ..Default::default()
    });
    let prefs = store.get_preferences();
    assert_eq!(prefs.theme, Theme::Dark);
    assert!(prefs.auto_sync);
  }

  #[test]
  fn test_unparsable_value_reads_as_absent() {
    let backend = MemoryBackend::new();
    backend
      .set(StoreKey::OfflineQueue.as_str(), "{not json")
      .unwrap();
    backend.set(StoreKey::LastSync.as_str(), "42x").unwrap();
    let store = LocalStore::new(backend);

    assert!(store.get_queue().is_empty());
    assert!(store.get_last_sync_time().is_none());
  }

  #[test]
  fn test_backend_failures_return_defaults() {
    let store = LocalStore::new(BrokenBackend);

    assert!(store.get_entities::<Tool>().is_empty());
    assert!(store.get_queue().is_empty());
    assert!(store.get_last_sync_time().is_none());
    assert_eq!(store.get_preferences(), UserPreferences::default());
    assert!(store
      .append_action(ActionOp::Tool(Mutation::Create(Tool::new("x"))))
      .is_none());
    store.save_entities(&[Tool::new("y")]);
    store.clear_all();
    assert_eq!(store.get_storage_usage().used, 0);
  }

  #[test]
  fn test_clear_all_removes_every_slice() {
    let store = LocalStore::in_memory();
    store.save_entities(&[Tool::new("a")]);
    store.set_last_sync_time(Utc::now());
    store.append_action(ActionOp::Tool(Mutation::Create(Tool::new("b"))));
    store.save_app_config(&AppConfig {
      last_export_time: Some(Utc::now()),
    });

    store.clear_all();

    assert!(store.get_entities::<Tool>().is_empty());
    assert!(store.get_queue().is_empty());
    assert!(store.get_last_sync_time().is_none());
    assert_eq!(store.get_app_config(), AppConfig::default());
    assert_eq!(store.get_storage_usage().used, 0);
  }

  #[test]
  fn test_last_sync_roundtrip_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(SqliteBackend::open(&dir.path().join("s.db")).unwrap());
    let now = Utc::now();
    store.set_last_sync_time(now);
    assert_eq!(store.get_last_sync_time(), Some(now));
  }
}
