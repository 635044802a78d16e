//! Core traits and types shared by every locally cached catalog entity.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::queue::{ActionOp, Mutation};

/// Sync state of a locally cached entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
  /// Local edits exist that have not been replayed yet
  #[default]
  Pending,
  /// Local copy matches what the remote last acknowledged
  Synced,
  /// Remote row changed after an unsynced local edit
  Conflict,
}

/// Kind tag of a catalog entity. Selects the store slice and remote table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
  Tool,
  Category,
}

impl EntityKind {
  pub const ALL: [EntityKind; 2] = [EntityKind::Tool, EntityKind::Category];

  /// Tag used in queued actions and log output.
  pub fn tag(self) -> &'static str {
    match self {
      EntityKind::Tool => "tool",
      EntityKind::Category => "category",
    }
  }

  /// Remote table holding rows of this kind.
  pub fn table(self) -> &'static str {
    match self {
      EntityKind::Tool => "tools",
      EntityKind::Category => "categories",
    }
  }
}

/// Identity and sync bookkeeping carried by every cached entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMeta {
  /// Remote identity, absent until the first successful sync
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  /// Client-generated identity
  pub local_id: String,
  pub last_modified: DateTime<Utc>,
  #[serde(default)]
  pub sync_status: SyncStatus,
}

impl EntityMeta {
  /// Metadata for an entity created locally and not yet synced.
  pub fn new_local() -> Self {
    Self {
      id: None,
      local_id: uuid::Uuid::now_v7().to_string(),
      last_modified: Utc::now(),
      sync_status: SyncStatus::Pending,
    }
  }

  /// Metadata for a row that was just read from the remote.
  pub fn from_remote(
    id: String,
    local_id: Option<String>,
    updated_at: Option<DateTime<Utc>>,
  ) -> Self {
    Self {
      local_id: local_id.unwrap_or_else(|| id.clone()),
      id: Some(id),
      last_modified: updated_at.unwrap_or_else(Utc::now),
      sync_status: SyncStatus::Synced,
    }
  }

  /// Whether this entity refers to `key`, by local or remote id.
  pub fn matches(&self, key: &str) -> bool {
    self.local_id == key || self.id.as_deref() == Some(key)
  }
}

/// Trait for entities that live in the local store and replay to a remote table.
pub trait CatalogEntity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  const KIND: EntityKind;

  fn meta(&self) -> &EntityMeta;

  fn meta_mut(&mut self) -> &mut EntityMeta;

  /// Row sent to the remote table. Excludes the remote id and sync bookkeeping.
  fn to_remote_record(&self) -> Value;

  /// Build a synced entity from a remote row.
  fn from_remote_record(record: Value) -> serde_json::Result<Self>;

  /// Wrap a mutation of this kind into a queueable action.
  fn into_action(mutation: Mutation<Self>) -> ActionOp;
}
