//! Sync orchestrator.
//!
//! Owns connectivity and sync status, applies local-first mutations (each one
//! recorded in the offline queue) and drains the queue through the remote
//! query layer. At most one drain runs at a time; a drain that hits an error
//! leaves the whole queue for the next attempt.

mod replay;
mod state;

pub use state::{SyncOutcome, SyncState};

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{ImportError, RemoteError, SyncError};
use crate::model::{CatalogEntity, Category, PreferencesPatch, SyncStatus, Tool, UserPreferences};
use crate::queue::{EntityRef, Mutation};
use crate::remote::RemoteQueryLayer;
use crate::store::LocalStore;
use crate::transfer::{self, ImportSummary};
use replay::{ReplayOutcome, Replayer};

/// Page size used when pulling a whole table into the local store.
const REFRESH_PAGE_SIZE: u32 = 100;

/// Resets the syncing flag when a drain settles, however it settles.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

pub struct SyncOrchestrator {
  store: LocalStore,
  remote: RemoteQueryLayer,
  state: watch::Sender<SyncState>,
  syncing: AtomicBool,
  online: AtomicBool,
  preferences: Mutex<UserPreferences>,
  /// Serializes read-modify-write of the entity slices
  entities_lock: Mutex<()>,
}

impl SyncOrchestrator {
  /// Create an orchestrator. Preferences are read from the store once, here.
  pub fn new(store: LocalStore, remote: RemoteQueryLayer, online: bool) -> Self {
    let preferences = store.get_preferences();
    let initial = SyncState {
      is_online: online && !preferences.offline_mode,
      is_syncing: false,
      last_sync_time: store.get_last_sync_time(),
      sync_error: None,
      pending_count: store.get_queue().len(),
      storage_usage: store.get_storage_usage(),
    };
    let (state, _) = watch::channel(initial);

    Self {
      store,
      remote,
      state,
      syncing: AtomicBool::new(false),
      online: AtomicBool::new(online),
      preferences: Mutex::new(preferences),
      entities_lock: Mutex::new(()),
    }
  }

  pub fn store(&self) -> &LocalStore {
    &self.store
  }

  pub fn remote(&self) -> &RemoteQueryLayer {
    &self.remote
  }

  /// Current state snapshot.
  pub fn state(&self) -> SyncState {
    self.state.borrow().clone()
  }

  /// Receiver notified on every state change.
  pub fn subscribe(&self) -> watch::Receiver<SyncState> {
    self.state.subscribe()
  }

  pub fn preferences(&self) -> UserPreferences {
    self.lock_preferences().clone()
  }

  /// Apply `patch`, persist immediately and return the new preferences.
  pub fn set_preferences(&self, patch: PreferencesPatch) -> UserPreferences {
    let updated = {
      let mut prefs = self.lock_preferences();
      prefs.apply(patch);
      self.store.replace_preferences(&prefs);
      prefs.clone()
    };
    self.publish(|_| {});
    updated
  }

  fn lock_preferences(&self) -> MutexGuard<'_, UserPreferences> {
    self
      .preferences
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn lock_entities(&self) -> MutexGuard<'_, ()> {
    self
      .entities_lock
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Connected, and not forced offline by preference.
  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::Acquire) && !self.lock_preferences().offline_mode
  }

  pub fn is_syncing(&self) -> bool {
    self.syncing.load(Ordering::Acquire)
  }

  pub fn pending_count(&self) -> usize {
    self.store.get_queue().len()
  }

  /// Recompute derived fields, apply `f`, and notify observers.
  fn publish(&self, f: impl FnOnce(&mut SyncState)) {
    let pending_count = self.pending_count();
    let storage_usage = self.store.get_storage_usage();
    let is_online = self.is_online();
    let is_syncing = self.is_syncing();
    self.state.send_modify(|state| {
      state.pending_count = pending_count;
      state.storage_usage = storage_usage;
      state.is_online = is_online;
      state.is_syncing = is_syncing;
      f(state);
    });
  }

  /// Initial load: drain if already online with pending work.
  pub async fn start(&self) -> Option<Result<SyncOutcome, SyncError>> {
    self.publish(|_| {});
    if self.is_online() && self.pending_count() > 0 {
      info!(pending = self.pending_count(), "pending work found at start");
      return Some(self.sync_data().await);
    }
    None
  }

  /// Record a connectivity change.
  ///
  /// Going online with auto-sync enabled and a non-empty queue drains the
  /// queue before returning. Going offline never interrupts a drain in flight.
  pub async fn set_online(&self, online: bool) {
    let was_online = self.online.swap(online, Ordering::AcqRel);
    self.publish(|_| {});
    if online == was_online {
      return;
    }
    info!(online, "connectivity changed");

    if online && self.preferences().auto_sync && self.pending_count() > 0 {
      if let Err(e) = self.sync_data().await {
        warn!(error = %e, "sync after reconnect failed");
      }
    }
  }

  /// Drain now. Rejected immediately while offline.
  pub async fn force_sync_data(&self) -> Result<SyncOutcome, SyncError> {
    if !self.is_online() {
      return Err(SyncError::Offline);
    }
    self.sync_data().await
  }

  /// Replay the queue in order against the remote.
  ///
  /// No-op while another drain is in flight or when the queue is empty. On
  /// failure the queue is left untouched and the error is also stored in
  /// [`SyncState::sync_error`].
  pub async fn sync_data(&self) -> Result<SyncOutcome, SyncError> {
    if self
      .syncing
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      debug!("sync already in progress");
      return Ok(SyncOutcome::AlreadySyncing);
    }
    let _guard = SyncingGuard(&self.syncing);

    let queue = self.store.get_queue();
    if queue.is_empty() {
      return Ok(SyncOutcome::NothingToSync);
    }

    self.publish(|state| state.sync_error = None);
    info!(actions = queue.len(), "draining offline queue");

    let mut replayer = Replayer::new(&self.remote);
    let mut failure = None;
    for action in &queue {
      if let Err(e) = replayer.replay(action).await {
        failure = Some(e);
        break;
      }
    }

    let settled_at = Utc::now();
    self.store.set_last_sync_time(settled_at);

    match failure {
      None => {
        let drained: HashSet<String> = queue.iter().map(|a| a.id.clone()).collect();
        self.commit_drain(&drained, &replayer.into_outcome());
        drop(_guard);
        self.publish(|state| {
          state.last_sync_time = Some(settled_at);
          state.sync_error = None;
        });
        info!(replayed = queue.len(), "offline queue drained");
        Ok(SyncOutcome::Completed {
          replayed: queue.len(),
        })
      }
      Some(e) => {
        let message = e.to_string();
        warn!(error = %message, "sync failed, queue kept for retry");
        drop(_guard);
        self.publish(|state| {
          state.last_sync_time = Some(settled_at);
          state.sync_error = Some(message);
        });
        Err(e)
      }
    }
  }

  /// Remove the drained actions and settle every entity without queued work.
  ///
  /// Entities whose update found no remote row become [`SyncStatus::Conflict`];
  /// the rest become synced once they have a remote id.
  fn commit_drain(&self, drained: &HashSet<String>, outcome: &ReplayOutcome) {
    let _entities = self.lock_entities();
    let remaining = self.store.remove_actions(drained);
    let still_queued: HashSet<&str> = remaining.iter().map(|a| a.op.local_id()).collect();

    self.mark_synced::<Tool>(outcome, &still_queued);
    self.mark_synced::<Category>(outcome, &still_queued);
  }

  fn mark_synced<E: CatalogEntity>(&self, outcome: &ReplayOutcome, still_queued: &HashSet<&str>) {
    let mut entities = self.store.get_entities::<E>();
    for entity in &mut entities {
      let meta = entity.meta_mut();
      if still_queued.contains(meta.local_id.as_str()) {
        continue;
      }
      if outcome.conflicts.contains(&meta.local_id) {
        meta.sync_status = SyncStatus::Conflict;
        continue;
      }
      if meta.id.is_none() {
        meta.id = outcome.resolved.get(&meta.local_id).cloned();
      }
      if meta.id.is_some() {
        meta.sync_status = SyncStatus::Synced;
      } else {
        warn!(
          entity = E::KIND.tag(),
          local_id = %meta.local_id,
          "entity has no remote id after drain"
        );
      }
    }
    self.store.save_entities(&entities);
  }

  /// Cached entities of kind `E`.
  pub fn entities<E: CatalogEntity>(&self) -> Vec<E> {
    self.store.get_entities::<E>()
  }

  /// Store a new entity locally and queue its creation.
  ///
  /// The action is queued before the entity slice is written; if the queue
  /// cannot be persisted nothing is stored and [`SyncError::NotQueued`] is
  /// returned.
  pub async fn add_entity<E: CatalogEntity>(&self, mut entity: E) -> Result<E, SyncError> {
    {
      let _entities = self.lock_entities();
      let meta = entity.meta_mut();
      meta.id = None;
      meta.sync_status = SyncStatus::Pending;
      meta.last_modified = Utc::now();

      self.queue::<E>(Mutation::Create(entity.clone()))?;
      let mut entities = self.store.get_entities::<E>();
      entities.push(entity.clone());
      self.store.save_entities(&entities);
    }
    self.after_local_mutation().await;
    Ok(entity)
  }

  /// Edit the entity whose local or remote id is `key`, and queue the update.
  ///
  /// `Ok(None)` when no entity matches `key`.
  pub async fn update_entity<E, F>(&self, key: &str, edit: F) -> Result<Option<E>, SyncError>
  where
    E: CatalogEntity,
    F: FnOnce(&mut E),
  {
    let updated = {
      let _entities = self.lock_entities();
      let mut entities = self.store.get_entities::<E>();
      let Some(entity) = entities.iter_mut().find(|e| e.meta().matches(key)) else {
        return Ok(None);
      };
      edit(entity);
      let meta = entity.meta_mut();
      meta.sync_status = SyncStatus::Pending;
      meta.last_modified = Utc::now();
      let updated = entity.clone();

      self.queue::<E>(Mutation::Update(updated.clone()))?;
      self.store.save_entities(&entities);
      updated
    };
    self.after_local_mutation().await;
    Ok(Some(updated))
  }

  /// Remove the entity whose local or remote id is `key`, and queue the delete.
  ///
  /// `Ok(false)` when no entity matches `key`.
  pub async fn delete_entity<E: CatalogEntity>(&self, key: &str) -> Result<bool, SyncError> {
    {
      let _entities = self.lock_entities();
      let mut entities = self.store.get_entities::<E>();
      let Some(position) = entities.iter().position(|e| e.meta().matches(key)) else {
        return Ok(false);
      };
      let removed = entities.remove(position);

      self.queue::<E>(Mutation::Delete(EntityRef::of(&removed)))?;
      self.store.save_entities(&entities);
    }
    self.after_local_mutation().await;
    Ok(true)
  }

  /// Append `mutation` to the offline queue. Callers hold the entities lock.
  fn queue<E: CatalogEntity>(&self, mutation: Mutation<E>) -> Result<(), SyncError> {
    let action = mutation.name();
    match self.store.append_action(E::into_action(mutation)) {
      Some(_) => Ok(()),
      None => {
        warn!(entity = E::KIND.tag(), action, "local change dropped, queue not writable");
        Err(SyncError::NotQueued {
          entity: E::KIND.tag(),
          action,
        })
      }
    }
  }

  pub async fn add_tool(&self, tool: Tool) -> Result<Tool, SyncError> {
    self.add_entity(tool).await
  }

  pub async fn update_tool<F: FnOnce(&mut Tool)>(
    &self,
    key: &str,
    edit: F,
  ) -> Result<Option<Tool>, SyncError> {
    self.update_entity(key, edit).await
  }

  pub async fn delete_tool(&self, key: &str) -> Result<bool, SyncError> {
    self.delete_entity::<Tool>(key).await
  }

  pub async fn add_category(&self, category: Category) -> Result<Category, SyncError> {
    self.add_entity(category).await
  }

  pub async fn update_category<F: FnOnce(&mut Category)>(
    &self,
    key: &str,
    edit: F,
  ) -> Result<Option<Category>, SyncError> {
    self.update_entity(key, edit).await
  }

  pub async fn delete_category(&self, key: &str) -> Result<bool, SyncError> {
    self.delete_entity::<Category>(key).await
  }

  /// Import an export file and pick up the preferences it carried.
  pub fn import_from(&self, path: &Path) -> Result<ImportSummary, ImportError> {
    let summary = {
      let _entities = self.lock_entities();
      transfer::import_from(&self.store, path)?
    };
    *self.lock_preferences() = self.store.get_preferences();
    self.publish(|_| {});
    Ok(summary)
  }

  async fn after_local_mutation(&self) {
    self.publish(|_| {});
    if self.is_online() && self.preferences().auto_sync {
      if let Err(e) = self.sync_data().await {
        warn!(error = %e, "sync after local change failed");
      }
    }
  }

  /// Pull the remote table of `E` into the local store.
  ///
  /// Entities with queued actions keep their local copy and are flagged
  /// [`SyncStatus::Conflict`] when the remote row changed after the local
  /// edit. Rows deleted locally but not yet replayed are not brought back.
  /// Returns the number of cached entities afterwards.
  pub async fn refresh<E: CatalogEntity>(&self) -> Result<usize, RemoteError> {
    let rows = self
      .remote
      .fetch_all(E::KIND.table(), REFRESH_PAGE_SIZE)
      .await?;
    let fetched: Vec<E> = rows
      .into_iter()
      .filter_map(|row| match E::from_remote_record(row) {
        Ok(entity) => Some(entity),
        Err(e) => {
          warn!(entity = E::KIND.tag(), error = %e, "skipping malformed remote row");
          None
        }
      })
      .collect();

    let total = {
      let _entities = self.lock_entities();
      let queue = self.store.get_queue();
      let queued: HashSet<&str> = queue
        .iter()
        .filter(|a| a.op.kind() == E::KIND)
        .map(|a| a.op.local_id())
        .collect();

      let same = |a: &E, b: &E| {
        a.meta().local_id == b.meta().local_id
          || (a.meta().id.is_some() && a.meta().id == b.meta().id)
      };

      let mut merged: Vec<E> = Vec::new();
      let mut conflicts = 0;
      for mut local in self.store.get_entities::<E>() {
        if !queued.contains(local.meta().local_id.as_str()) {
          continue;
        }
        if let Some(remote) = fetched.iter().find(|r| same(&local, r)) {
          if remote.meta().last_modified > local.meta().last_modified {
            local.meta_mut().sync_status = SyncStatus::Conflict;
            conflicts += 1;
          }
        }
        merged.push(local);
      }

      for remote in fetched {
        let shadowed = merged.iter().any(|l| same(l, &remote))
          || queued.contains(remote.meta().local_id.as_str());
        if !shadowed {
          merged.push(remote);
        }
      }

      if conflicts > 0 {
        warn!(entity = E::KIND.tag(), conflicts, "remote changed entities with unsynced edits");
      }
      self.store.save_entities(&merged);
      merged.len()
    };

    self.publish(|_| {});
    debug!(entity = E::KIND.tag(), total, "refreshed from remote");
    Ok(total)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::StorageError;
  use crate::remote::{
    ChangeEvent, ChannelFilter, MemoryRemote, RemoteBackend, SelectRequest, SelectResponse,
  };
  use crate::store::{KeyValueBackend, MemoryBackend, StoreKey};
  use async_trait::async_trait;
  use serde_json::{json, Value};
  use std::sync::Arc;
  use tokio::sync::mpsc;

  fn setup(online: bool) -> (Arc<MemoryRemote>, SyncOrchestrator) {
    let remote = Arc::new(MemoryRemote::new());
    let layer = RemoteQueryLayer::new(Arc::clone(&remote) as Arc<dyn RemoteBackend>);
    let orchestrator = SyncOrchestrator::new(LocalStore::in_memory(), layer, online);
    (remote, orchestrator)
  }

  fn all_synced<E: CatalogEntity>(orchestrator: &SyncOrchestrator) -> bool {
    orchestrator
      .entities::<E>()
      .iter()
      .all(|e| e.meta().sync_status == SyncStatus::Synced && e.meta().id.is_some())
  }

  #[tokio::test]
  async fn test_offline_mutations_are_queued_without_coalescing() {
    let (remote, orchestrator) = setup(false);

    let tool = orchestrator.add_tool(Tool::new("ripgrep")).await.unwrap();
    let key = tool.meta.local_id.clone();
    orchestrator
      .update_tool(&key, |t| t.url = Some("https://example.test".into()))
      .await
      .unwrap()
      .unwrap();
    assert!(orchestrator.delete_tool(&key).await.unwrap());
    orchestrator.add_category(Category::new("Search")).await.unwrap();

    let queue = orchestrator.store().get_queue();
    let names: Vec<&str> = queue.iter().map(|a| a.op.action_name()).collect();
    assert_eq!(names, vec!["create", "update", "delete", "create"]);
    assert_eq!(orchestrator.state().pending_count, 4);
    assert_eq!(remote.calls().total(), 0);
  }

  #[tokio::test]
  async fn test_sync_with_empty_queue_is_noop() {
    let (remote, orchestrator) = setup(true);
    let before = orchestrator.state();

    let outcome = orchestrator.sync_data().await.unwrap();

    assert_eq!(outcome, SyncOutcome::NothingToSync);
    assert_eq!(remote.calls().total(), 0);
    assert_eq!(orchestrator.state(), before);
    assert!(orchestrator.store().get_last_sync_time().is_none());
  }

  #[tokio::test]
  async fn test_reconnect_drains_queue_and_marks_synced() {
    let (remote, orchestrator) = setup(false);
    for name in ["t1", "t2", "t3"] {
      orchestrator.add_tool(Tool::new(name)).await.unwrap();
    }
    assert_eq!(orchestrator.store().get_queue().len(), 3);

    orchestrator.set_online(true).await;

    assert!(orchestrator.store().get_queue().is_empty());
    assert_eq!(orchestrator.entities::<Tool>().len(), 3);
    assert!(all_synced::<Tool>(&orchestrator));
    assert_eq!(remote.rows("tools").len(), 3);

    let state = orchestrator.state();
    assert!(state.is_online);
    assert!(!state.is_syncing);
    assert_eq!(state.pending_count, 0);
    assert!(state.last_sync_time.is_some());
    assert!(state.sync_error.is_none());
  }

  #[tokio::test]
  async fn test_failed_replay_keeps_whole_queue() {
    let (remote, orchestrator) = setup(false);
    for name in ["a", "b", "c", "d"] {
      orchestrator.add_tool(Tool::new(name)).await.unwrap();
    }
    let before = orchestrator.store().get_queue();

    // third create fails
    remote.fail_writes_after(2);
    orchestrator.set_online(true).await;

    assert_eq!(orchestrator.store().get_queue(), before);
    let state = orchestrator.state();
    assert!(state.sync_error.is_some());
    assert!(!state.is_syncing);
    assert!(state.last_sync_time.is_some());
    assert!(orchestrator
      .entities::<Tool>()
      .iter()
      .all(|t| t.meta.sync_status == SyncStatus::Pending));
  }

  #[tokio::test]
  async fn test_retry_after_partial_failure_does_not_duplicate_creates() {
    let (remote, orchestrator) = setup(false);
    for name in ["a", "b", "c"] {
      orchestrator.add_tool(Tool::new(name)).await.unwrap();
    }

    remote.fail_writes_after(2);
    orchestrator.set_online(true).await;
    assert_eq!(remote.rows("tools").len(), 2);

    remote.clear_failures();
    let outcome = orchestrator.force_sync_data().await.unwrap();

    assert_eq!(outcome, SyncOutcome::Completed { replayed: 3 });
    assert_eq!(remote.rows("tools").len(), 3);
    assert!(all_synced::<Tool>(&orchestrator));
    assert!(orchestrator.state().sync_error.is_none());
  }

  #[tokio::test]
  async fn test_create_update_delete_replay_in_order() {
    let (remote, orchestrator) = setup(false);
    let keep = orchestrator.add_tool(Tool::new("keep")).await.unwrap();
    let gone = orchestrator.add_tool(Tool::new("gone")).await.unwrap();
    orchestrator
      .update_tool(&keep.meta.local_id, |t| t.name = "kept".into())
      .await
      .unwrap();
    orchestrator
      .update_tool(&gone.meta.local_id, |t| t.name = "going".into())
      .await
      .unwrap();
    orchestrator.delete_tool(&gone.meta.local_id).await.unwrap();

    orchestrator.set_online(true).await;

    let rows = remote.rows("tools");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], json!("kept"));
    assert_eq!(rows[0]["local_id"], json!(keep.meta.local_id));
    assert!(orchestrator.store().get_queue().is_empty());
  }

  #[tokio::test]
  async fn test_force_sync_rejects_when_offline() {
    let (remote, orchestrator) = setup(false);
    orchestrator.add_tool(Tool::new("x")).await.unwrap();

    let err = orchestrator.force_sync_data().await.unwrap_err();
    assert!(matches!(err, SyncError::Offline));
    assert_eq!(remote.calls().total(), 0);
    assert_eq!(orchestrator.pending_count(), 1);
  }

  #[tokio::test]
  async fn test_offline_mode_preference_blocks_sync() {
    let (_remote, orchestrator) = setup(true);
    orchestrator.set_preferences(PreferencesPatch {
      offline_mode: Some(true),
      ..Default::default()
    });
    orchestrator.add_tool(Tool::new("x")).await.unwrap();

    assert!(!orchestrator.state().is_online);
    assert_eq!(orchestrator.pending_count(), 1);
    assert!(matches!(
      orchestrator.force_sync_data().await,
      Err(SyncError::Offline)
    ));
  }

  #[tokio::test]
  async fn test_reconnect_without_auto_sync_keeps_queue() {
    let (remote, orchestrator) = setup(false);
    orchestrator.set_preferences(PreferencesPatch {
      auto_sync: Some(false),
      ..Default::default()
    });
    orchestrator.add_tool(Tool::new("x")).await.unwrap();

    orchestrator.set_online(true).await;

    assert_eq!(orchestrator.pending_count(), 1);
    assert_eq!(remote.calls().total(), 0);
    assert!(!orchestrator.store().get_preferences().auto_sync);
  }

  #[tokio::test]
  async fn test_online_mutation_syncs_immediately() {
    let (remote, orchestrator) = setup(true);
    orchestrator.add_category(Category::new("Editors")).await.unwrap();

    assert_eq!(orchestrator.pending_count(), 0);
    assert_eq!(remote.rows("categories").len(), 1);
    assert!(all_synced::<Category>(&orchestrator));
  }

  #[tokio::test]
  async fn test_second_sync_while_syncing_is_noop() {
    let (remote, orchestrator) = setup(false);
    orchestrator.add_tool(Tool::new("x")).await.unwrap();
    orchestrator.online.store(true, Ordering::Release);

    // a drain in flight
    orchestrator.syncing.store(true, Ordering::Release);
    let outcome = orchestrator.sync_data().await.unwrap();
    assert_eq!(outcome, SyncOutcome::AlreadySyncing);
    assert_eq!(remote.calls().total(), 0);
    assert!(orchestrator.is_syncing());
    assert_eq!(orchestrator.pending_count(), 1);

    orchestrator.syncing.store(false, Ordering::Release);
    let outcome = orchestrator.sync_data().await.unwrap();
    assert_eq!(outcome, SyncOutcome::Completed { replayed: 1 });
    assert!(!orchestrator.is_syncing());
  }

  #[tokio::test]
  async fn test_start_drains_pending_work() {
    let remote = Arc::new(MemoryRemote::new());
    let store = LocalStore::in_memory();
    {
      let offline = SyncOrchestrator::new(
        store.clone(),
        RemoteQueryLayer::new(Arc::clone(&remote) as Arc<dyn RemoteBackend>),
        false,
      );
      offline.add_tool(Tool::new("persisted")).await.unwrap();
    }

    let orchestrator = SyncOrchestrator::new(
      store,
      RemoteQueryLayer::new(Arc::clone(&remote) as Arc<dyn RemoteBackend>),
      true,
    );
    let outcome = orchestrator.start().await.unwrap().unwrap();

    assert_eq!(outcome, SyncOutcome::Completed { replayed: 1 });
    assert_eq!(remote.rows("tools").len(), 1);
  }

  #[tokio::test]
  async fn test_refresh_merges_and_flags_conflicts() {
    let (remote, orchestrator) = setup(true);
    orchestrator.add_tool(Tool::new("shared")).await.unwrap();
    let shared = orchestrator.entities::<Tool>().remove(0);
    let remote_id = shared.meta.id.clone().unwrap();

    orchestrator.online.store(false, Ordering::Release);
    orchestrator
      .update_tool(&shared.meta.local_id, |t| t.name = "local edit".into())
      .await
      .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    // someone else edits the same row and adds another
    remote
      .update("tools", &remote_id, json!({"name": "remote edit"}))
      .await
      .unwrap();
    remote.seed("tools", vec![json!({"id": "other", "name": "other"})]);

    let total = orchestrator.refresh::<Tool>().await.unwrap();
    assert_eq!(total, 2);

    let tools = orchestrator.entities::<Tool>();
    let local = tools
      .iter()
      .find(|t| t.meta.local_id == shared.meta.local_id)
      .unwrap();
    assert_eq!(local.name, "local edit");
    assert_eq!(local.meta.sync_status, SyncStatus::Conflict);
    assert!(tools
      .iter()
      .any(|t| t.name == "other" && t.meta.sync_status == SyncStatus::Synced));
  }

  #[tokio::test]
  async fn test_refresh_does_not_resurrect_local_deletes() {
    let (remote, orchestrator) = setup(true);
    let tool = orchestrator.add_tool(Tool::new("doomed")).await.unwrap();
    orchestrator.online.store(false, Ordering::Release);
    orchestrator.delete_tool(&tool.meta.local_id).await.unwrap();

    orchestrator.refresh::<Tool>().await.unwrap();

    assert!(orchestrator.entities::<Tool>().is_empty());
    assert_eq!(remote.rows("tools").len(), 1);
  }

  #[tokio::test]
  async fn test_import_refreshes_preferences_and_pending_count() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("export.json");
    let source = LocalStore::in_memory();
    source.save_entities(&[Tool::new("imported")]);
    source.save_preferences(PreferencesPatch {
      offline_mode: Some(true),
      ..Default::default()
    });
    transfer::export_to(&source, &path).unwrap();

    let (remote, orchestrator) = setup(true);
    let summary = orchestrator.import_from(&path).unwrap();

    assert_eq!(summary.requeued, 1);
    assert!(orchestrator.preferences().offline_mode);
    let state = orchestrator.state();
    assert!(!state.is_online);
    assert_eq!(state.pending_count, 1);
    assert_eq!(remote.calls().total(), 0);
  }

  #[tokio::test]
  async fn test_state_changes_are_observable() {
    let (_remote, orchestrator) = setup(false);
    let mut rx = orchestrator.subscribe();
    rx.borrow_and_update();

    orchestrator.add_tool(Tool::new("x")).await.unwrap();

    assert!(rx.has_changed().unwrap());
    assert_eq!(rx.borrow_and_update().pending_count, 1);
  }

  /// Local backend that refuses to persist the offline queue.
  #[derive(Default)]
  struct QueueWriteFails(MemoryBackend);

  impl KeyValueBackend for QueueWriteFails {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
      self.0.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
      if key == StoreKey::OfflineQueue.as_str() {
        return Err(StorageError::LockPoisoned);
      }
      self.0.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
      self.0.remove(key)
    }

    fn entries(&self, prefix: &str) -> Result<Vec<(String, String)>, StorageError> {
      self.0.entries(prefix)
    }
  }

  #[tokio::test]
  async fn test_mutations_fail_without_touching_entities_when_queue_is_unwritable() {
    let remote = Arc::new(MemoryRemote::new());
    let layer = RemoteQueryLayer::new(Arc::clone(&remote) as Arc<dyn RemoteBackend>);
    let store = LocalStore::new(QueueWriteFails::default());
    let mut existing = Tool::new("existing");
    existing.meta.id = Some("r1".into());
    existing.meta.sync_status = SyncStatus::Synced;
    store.save_entities(&[existing.clone()]);
    let orchestrator = SyncOrchestrator::new(store, layer, false);

    let err = orchestrator.add_tool(Tool::new("lost")).await.unwrap_err();
    assert!(matches!(
      err,
      SyncError::NotQueued {
        entity: "tool",
        action: "create"
      }
    ));
    let err = orchestrator
      .update_tool("r1", |t| t.name = "renamed".into())
      .await
      .unwrap_err();
    assert!(matches!(err, SyncError::NotQueued { action: "update", .. }));
    let err = orchestrator.delete_tool("r1").await.unwrap_err();
    assert!(matches!(err, SyncError::NotQueued { action: "delete", .. }));

    assert_eq!(orchestrator.entities::<Tool>(), vec![existing]);
    assert_eq!(orchestrator.pending_count(), 0);

    orchestrator.set_online(true).await;
    assert_eq!(orchestrator.sync_data().await.unwrap(), SyncOutcome::NothingToSync);
    assert!(remote.rows("tools").is_empty());
    assert!(orchestrator
      .entities::<Tool>()
      .iter()
      .all(|t| t.meta.sync_status != SyncStatus::Pending));
  }

  /// Remote that queues a local change while the first insert of a drain is in flight.
  struct EditDuringDrain {
    inner: Arc<MemoryRemote>,
    store: LocalStore,
    late: Mutex<Option<Tool>>,
  }

  #[async_trait]
  impl RemoteBackend for EditDuringDrain {
    async fn select(
      &self,
      table: &str,
      request: &SelectRequest,
    ) -> Result<SelectResponse, RemoteError> {
      self.inner.select(table, request).await
    }

    async fn insert(&self, table: &str, record: Value) -> Result<Value, RemoteError> {
      let late = self.late.lock().unwrap().take();
      if let Some(tool) = late {
        self
          .store
          .append_action(Tool::into_action(Mutation::Create(tool.clone())))
          .unwrap();
        let mut tools = self.store.get_entities::<Tool>();
        tools.push(tool);
        self.store.save_entities(&tools);
      }
      self.inner.insert(table, record).await
    }

    async fn update(&self, table: &str, id: &str, changes: Value) -> Result<Value, RemoteError> {
      self.inner.update(table, id, changes).await
    }

    async fn delete(&self, table: &str, id: &str) -> Result<Value, RemoteError> {
      self.inner.delete(table, id).await
    }

    async fn open_channel(
      &self,
      table: &str,
      filter: Option<&ChannelFilter>,
    ) -> Result<mpsc::UnboundedReceiver<ChangeEvent>, RemoteError> {
      self.inner.open_channel(table, filter).await
    }
  }

  #[tokio::test]
  async fn test_change_queued_during_drain_survives_commit() {
    let remote = Arc::new(MemoryRemote::new());
    let store = LocalStore::in_memory();
    let mut late = Tool::new("late");
    late.meta.sync_status = SyncStatus::Pending;
    let backend = EditDuringDrain {
      inner: Arc::clone(&remote),
      store: store.clone(),
      late: Mutex::new(Some(late.clone())),
    };
    let layer = RemoteQueryLayer::new(Arc::new(backend) as Arc<dyn RemoteBackend>);
    let orchestrator = SyncOrchestrator::new(store, layer, false);
    let early = orchestrator.add_tool(Tool::new("early")).await.unwrap();

    orchestrator.online.store(true, Ordering::Release);
    let outcome = orchestrator.sync_data().await.unwrap();

    assert_eq!(outcome, SyncOutcome::Completed { replayed: 1 });
    let queue = orchestrator.store().get_queue();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].op.action_name(), "create");
    assert_eq!(queue[0].op.local_id(), late.meta.local_id);
    assert_eq!(orchestrator.state().pending_count, 1);

    let tools = orchestrator.entities::<Tool>();
    let synced = tools
      .iter()
      .find(|t| t.meta.local_id == early.meta.local_id)
      .unwrap();
    assert_eq!(synced.meta.sync_status, SyncStatus::Synced);
    let pending = tools
      .iter()
      .find(|t| t.meta.local_id == late.meta.local_id)
      .unwrap();
    assert_eq!(pending.meta.sync_status, SyncStatus::Pending);
    assert!(pending.meta.id.is_none());
    assert_eq!(remote.rows("tools").len(), 1);

    let outcome = orchestrator.sync_data().await.unwrap();
    assert_eq!(outcome, SyncOutcome::Completed { replayed: 1 });
    assert!(all_synced::<Tool>(&orchestrator));
    assert_eq!(remote.rows("tools").len(), 2);
  }

  #[tokio::test]
  async fn test_update_of_remotely_deleted_row_is_flagged_and_drain_continues() {
    let (remote, orchestrator) = setup(true);
    let vanishing = orchestrator.add_tool(Tool::new("vanishing")).await.unwrap();
    let remote_id = orchestrator.entities::<Tool>()[0].meta.id.clone().unwrap();

    orchestrator.set_online(false).await;
    orchestrator
      .update_tool(&vanishing.meta.local_id, |t| t.name = "edited".into())
      .await
      .unwrap();
    let after = orchestrator.add_tool(Tool::new("after")).await.unwrap();
    remote.delete("tools", &remote_id).await.unwrap();

    orchestrator.set_online(true).await;

    let state = orchestrator.state();
    assert!(state.sync_error.is_none());
    assert_eq!(state.pending_count, 0);
    assert!(orchestrator.store().get_queue().is_empty());

    let tools = orchestrator.entities::<Tool>();
    let flagged = tools
      .iter()
      .find(|t| t.meta.local_id == vanishing.meta.local_id)
      .unwrap();
    assert_eq!(flagged.name, "edited");
    assert_eq!(flagged.meta.sync_status, SyncStatus::Conflict);
    let synced = tools
      .iter()
      .find(|t| t.meta.local_id == after.meta.local_id)
      .unwrap();
    assert_eq!(synced.meta.sync_status, SyncStatus::Synced);
    assert_eq!(remote.rows("tools").len(), 1);
  }
}
