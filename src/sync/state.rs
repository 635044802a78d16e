use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::store::StorageUsage;

/// Snapshot of orchestrator state published to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
  pub is_online: bool,
  pub is_syncing: bool,
  pub last_sync_time: Option<DateTime<Utc>>,
  /// Message of the last failed drain, cleared when a drain starts
  pub sync_error: Option<String>,
  pub pending_count: usize,
  pub storage_usage: StorageUsage,
}

impl SyncState {
  pub fn is_offline(&self) -> bool {
    !self.is_online
  }

  pub fn has_pending(&self) -> bool {
    self.pending_count > 0
  }
}

/// What a call to [`super::SyncOrchestrator::sync_data`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
  /// Another drain was already in flight
  AlreadySyncing,
  /// The queue was empty
  NothingToSync,
  /// Every queued action was replayed and the queue cleared
  Completed { replayed: usize },
}
