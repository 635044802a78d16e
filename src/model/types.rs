use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::entity::{CatalogEntity, EntityKind, EntityMeta};
use super::remote_types::{reserialize, CategoryRow, ToolRow};
use crate::queue::{ActionOp, Mutation};

/// A catalog tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
  #[serde(flatten)]
  pub meta: EntityMeta,
  pub name: String,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub url: Option<String>,
  #[serde(default)]
  pub category_id: Option<String>,
  #[serde(default)]
  pub tags: Vec<String>,
}

impl Tool {
  /// A new, not yet synced tool.
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      meta: EntityMeta::new_local(),
      name: name.into(),
      description: None,
      url: None,
      category_id: None,
      tags: Vec::new(),
    }
  }
}

/// A catalog category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
  #[serde(flatten)]
  pub meta: EntityMeta,
  pub name: String,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub icon: Option<String>,
}

impl Category {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      meta: EntityMeta::new_local(),
      name: name.into(),
      description: None,
      icon: None,
    }
  }
}

impl CatalogEntity for Tool {
  const KIND: EntityKind = EntityKind::Tool;

  fn meta(&self) -> &EntityMeta {
    &self.meta
  }

  fn meta_mut(&mut self) -> &mut EntityMeta {
    &mut self.meta
  }

  fn to_remote_record(&self) -> Value {
    json!({
      "local_id": self.meta.local_id,
      "name": self.name,
      "description": self.description,
      "url": self.url,
      "category_id": self.category_id,
      "tags": self.tags,
    })
  }

  fn from_remote_record(record: Value) -> serde_json::Result<Self> {
    let row: ToolRow = reserialize(record)?;
    Ok(Self {
      meta: EntityMeta::from_remote(row.id, row.local_id, row.updated_at),
      name: row.name,
      description: row.description,
      url: row.url,
      category_id: row.category_id,
      tags: row.tags,
    })
  }

  fn into_action(mutation: Mutation<Self>) -> ActionOp {
    ActionOp::Tool(mutation)
  }
}

impl CatalogEntity for Category {
  const KIND: EntityKind = EntityKind::Category;

  fn meta(&self) -> &EntityMeta {
    &self.meta
  }

  fn meta_mut(&mut self) -> &mut EntityMeta {
    &mut self.meta
  }

  fn to_remote_record(&self) -> Value {
    json!({
      "local_id": self.meta.local_id,
      "name": self.name,
      "description": self.description,
      "icon": self.icon,
    })
  }

  fn from_remote_record(record: Value) -> serde_json::Result<Self> {
    let row: CategoryRow = reserialize(record)?;
    Ok(Self {
      meta: EntityMeta::from_remote(row.id, row.local_id, row.updated_at),
      name: row.name,
      description: row.description,
      icon: row.icon,
    })
  }

  fn into_action(mutation: Mutation<Self>) -> ActionOp {
    ActionOp::Category(mutation)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::SyncStatus;

  #[test]
  fn test_new_tool_is_pending_without_id() {
    let tool = Tool::new("ripgrep");
    assert_eq!(tool.meta.sync_status, SyncStatus::Pending);
    assert!(tool.meta.id.is_none());
    assert!(!tool.meta.local_id.is_empty());
  }

  #[test]
  fn test_tool_from_remote_row() {
    let tool = Tool::from_remote_record(json!({
      "id": 42,
      "local_id": "abc",
      "name": "fd",
      "tags": ["cli"],
      "updated_at": "2024-05-01T10:00:00Z",
      "created_at": "2024-05-01T09:00:00Z"
    }))
    .unwrap();

    assert_eq!(tool.meta.id.as_deref(), Some("42"));
    assert_eq!(tool.meta.local_id, "abc");
    assert_eq!(tool.meta.sync_status, SyncStatus::Synced);
    assert_eq!(tool.tags, vec!["cli".to_string()]);
  }

  #[test]
  fn test_remote_row_without_local_id_uses_remote_id() {
    let category = Category::from_remote_record(json!({"id": "c-1", "name": "Editors"})).unwrap();
    assert_eq!(category.meta.local_id, "c-1");
  }

  #[test]
  fn test_remote_record_omits_sync_fields() {
    let mut tool = Tool::new("bat");
    tool.meta.id = Some("7".into());
    let record = tool.to_remote_record();

    assert!(record.get("id").is_none());
    assert!(record.get("syncStatus").is_none());
    assert_eq!(record["local_id"], json!(tool.meta.local_id));
  }

  #[test]
  fn test_local_serialization_is_camel_case() {
    let tool = Tool::new("jq");
    let value = serde_json::to_value(&tool).unwrap();
    assert!(value.get("localId").is_some());
    assert_eq!(value["syncStatus"], json!("pending"));
    assert!(value.get("id").is_none());
  }
}
