//! Offline action queue records.
//!
//! Every local-first mutation becomes one [`OfflineAction`]. Actions are never
//! merged: a create, an update and a delete of the same entity are three
//! entries, replayed in that order. The queue itself lives in the local store
//! (see [`crate::store::LocalStore::append_action`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{CatalogEntity, Category, EntityKind, Tool};

/// Reference to an entity that was deleted locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  pub local_id: String,
}

impl EntityRef {
  pub fn of<E: CatalogEntity>(entity: &E) -> Self {
    Self {
      id: entity.meta().id.clone(),
      local_id: entity.meta().local_id.clone(),
    }
  }
}

/// A mutation of one entity, carrying a snapshot taken when it was queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Mutation<T> {
  Create(T),
  Update(T),
  Delete(EntityRef),
}

impl<T: CatalogEntity> Mutation<T> {
  pub fn name(&self) -> &'static str {
    match self {
      Mutation::Create(_) => "create",
      Mutation::Update(_) => "update",
      Mutation::Delete(_) => "delete",
    }
  }

  pub fn local_id(&self) -> &str {
    match self {
      Mutation::Create(entity) | Mutation::Update(entity) => &entity.meta().local_id,
      Mutation::Delete(entity_ref) => &entity_ref.local_id,
    }
  }
}

/// Queued operation, keyed by entity kind and mutation type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "lowercase")]
pub enum ActionOp {
  Tool(Mutation<Tool>),
  Category(Mutation<Category>),
}

impl ActionOp {
  pub fn kind(&self) -> EntityKind {
    match self {
      ActionOp::Tool(_) => EntityKind::Tool,
      ActionOp::Category(_) => EntityKind::Category,
    }
  }

  pub fn action_name(&self) -> &'static str {
    match self {
      ActionOp::Tool(m) => m.name(),
      ActionOp::Category(m) => m.name(),
    }
  }

  pub fn local_id(&self) -> &str {
    match self {
      ActionOp::Tool(m) => m.local_id(),
      ActionOp::Category(m) => m.local_id(),
    }
  }
}

/// An immutable queue record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineAction {
  /// Time-ordered UUIDv7, so ids sort in creation order
  pub id: String,
  pub timestamp: DateTime<Utc>,
  #[serde(flatten)]
  pub op: ActionOp,
}

impl OfflineAction {
  /// Stamp an operation with a fresh id and the current time.
  pub fn new(op: ActionOp) -> Self {
    Self {
      id: uuid::Uuid::now_v7().to_string(),
      timestamp: Utc::now(),
      op,
    }
  }
}
