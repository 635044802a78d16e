//! Export and import of local state as a single JSON file.
//!
//! Import validates every section present in the file before touching the
//! store, so a malformed file leaves local state exactly as it was.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

use crate::error::{ExportError, ImportError};
use crate::model::{CatalogEntity, Category, PreferencesPatch, SyncStatus, Tool, UserPreferences};
use crate::queue::Mutation;
use crate::store::LocalStore;

/// Contents of an export file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportBundle {
  pub tools: Vec<Tool>,
  pub categories: Vec<Category>,
  pub preferences: UserPreferences,
  pub export_time: DateTime<Utc>,
}

impl ExportBundle {
  pub fn from_store(store: &LocalStore) -> Self {
    Self {
      tools: store.get_entities(),
      categories: store.get_entities(),
      preferences: store.get_preferences(),
      export_time: Utc::now(),
    }
  }
}

/// What an import changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
  pub tools: Option<usize>,
  pub categories: Option<usize>,
  pub preferences: bool,
  /// Pending entities queued again for replay
  pub requeued: usize,
}

/// Write the current local state to `path` and record the export time.
pub fn export_to(store: &LocalStore, path: &Path) -> Result<ExportBundle, ExportError> {
  let bundle = ExportBundle::from_store(store);
  let json = serde_json::to_string_pretty(&bundle)?;
  std::fs::write(path, json)?;

  let mut app_config = store.get_app_config();
  app_config.last_export_time = Some(bundle.export_time);
  store.save_app_config(&app_config);

  info!(
    path = %path.display(),
    tools = bundle.tools.len(),
    categories = bundle.categories.len(),
    "exported local state"
  );
  Ok(bundle)
}

pub fn import_from(store: &LocalStore, path: &Path) -> Result<ImportSummary, ImportError> {
  let bytes = std::fs::read(path)?;
  import_bytes(store, &bytes)
}

/// Validated sections of an import file; `None` means the section was absent.
struct ValidatedImport {
  tools: Option<Vec<Tool>>,
  categories: Option<Vec<Category>>,
  preferences: Option<PreferencesPatch>,
}

/// Import an export file's contents.
///
/// Present sections replace the local entity lists; preferences are merged
/// over the stored ones. Entities that are not synced get a fresh create
/// (no remote id) or update action unless one is already queued for them.
pub fn import_bytes(store: &LocalStore, bytes: &[u8]) -> Result<ImportSummary, ImportError> {
  let value: Value = serde_json::from_slice(bytes)?;
  let Value::Object(mut object) = value else {
    return Err(ImportError::NotAnObject);
  };
  let validated = ValidatedImport {
    tools: section(&mut object, "tools")?,
    categories: section(&mut object, "categories")?,
    preferences: section(&mut object, "preferences")?,
  };
  if let Some(tools) = &validated.tools {
    check_entities(tools)?;
  }
  if let Some(categories) = &validated.categories {
    check_entities(categories)?;
  }

  let mut summary = ImportSummary::default();
  let queued: HashSet<String> = store
    .get_queue()
    .iter()
    .map(|a| a.op.local_id().to_string())
    .collect();

  if let Some(tools) = validated.tools {
    summary.requeued += apply_entities(store, &tools, &queued);
    summary.tools = Some(tools.len());
  }
  if let Some(categories) = validated.categories {
    summary.requeued += apply_entities(store, &categories, &queued);
    summary.categories = Some(categories.len());
  }
  if let Some(patch) = validated.preferences {
    store.save_preferences(patch);
    summary.preferences = true;
  }

  info!(
    tools = ?summary.tools,
    categories = ?summary.categories,
    preferences = summary.preferences,
    requeued = summary.requeued,
    "imported local state"
  );
  Ok(summary)
}

fn section<T: serde::de::DeserializeOwned>(
  object: &mut Map<String, Value>,
  name: &'static str,
) -> Result<Option<T>, ImportError> {
  match object.remove(name) {
    None | Some(Value::Null) => Ok(None),
    Some(value) => serde_json::from_value(value)
      .map(Some)
      .map_err(|source| ImportError::InvalidSection {
        section: name,
        source,
      }),
  }
}

fn check_entities<E: CatalogEntity>(entities: &[E]) -> Result<(), ImportError> {
  for entity in entities {
    let meta = entity.meta();
    if meta.local_id.trim().is_empty() {
      return Err(ImportError::MissingLocalId {
        entity: E::KIND.tag(),
      });
    }
    if meta.sync_status == SyncStatus::Synced && meta.id.is_none() {
      return Err(ImportError::SyncedWithoutId {
        entity: E::KIND.tag(),
        local_id: meta.local_id.clone(),
      });
    }
  }
  Ok(())
}

fn apply_entities<E: CatalogEntity>(
  store: &LocalStore,
  entities: &[E],
  queued: &HashSet<String>,
) -> usize {
  store.save_entities(entities);

  let mut requeued = 0;
  for entity in entities {
    let meta = entity.meta();
    if meta.sync_status == SyncStatus::Synced || queued.contains(&meta.local_id) {
      continue;
    }
    let mutation = if meta.id.is_none() {
      Mutation::Create(entity.clone())
    } else {
      Mutation::Update(entity.clone())
    };
    if store.append_action(E::into_action(mutation)).is_some() {
      requeued += 1;
    }
  }
  requeued
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::Theme;
  use serde_json::json;

  fn synced_tool(name: &str, id: &str) -> Tool {
    let mut tool = Tool::new(name);
    tool.meta.id = Some(id.to_string());
    tool.meta.sync_status = SyncStatus::Synced;
    tool
  }

  #[test]
  fn test_export_then_import_into_fresh_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("export.json");

    let source = LocalStore::in_memory();
    source.save_entities(&[synced_tool("rg", "1"), Tool::new("fd")]);
    source.save_entities(&[Category::new("CLI")]);
    source.save_preferences(PreferencesPatch {
      theme: Some(Theme::Dark),
      ..Default::default()
    });

    let bundle = export_to(&source, &path).unwrap();
    assert_eq!(
      source.get_app_config().last_export_time,
      Some(bundle.export_time)
    );
    let raw: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert!(raw.get("exportTime").is_some());

    let target = LocalStore::in_memory();
    let summary = import_from(&target, &path).unwrap();

    assert_eq!(summary.tools, Some(2));
    assert_eq!(summary.categories, Some(1));
    assert!(summary.preferences);
    // fd and CLI are pending
    assert_eq!(summary.requeued, 2);
    assert_eq!(target.get_entities::<Tool>(), source.get_entities::<Tool>());
    assert_eq!(target.get_preferences().theme, Theme::Dark);

    let queue = target.get_queue();
    let names: Vec<&str> = queue.iter().map(|a| a.op.action_name()).collect();
    assert_eq!(names, vec!["create", "create"]);
  }

  #[test]
  fn test_pending_with_remote_id_is_requeued_as_update() {
    let store = LocalStore::in_memory();
    let mut tool = synced_tool("rg", "42");
    tool.meta.sync_status = SyncStatus::Pending;
    let file = json!({ "tools": [tool] });

    let summary = import_bytes(&store, file.to_string().as_bytes()).unwrap();

    assert_eq!(summary.requeued, 1);
    assert_eq!(summary.categories, None);
    assert_eq!(store.get_queue()[0].op.action_name(), "update");
  }

  #[test]
  fn test_already_queued_entity_is_not_requeued() {
    let store = LocalStore::in_memory();
    let tool = Tool::new("rg");
    store.append_action(Tool::into_action(Mutation::Create(tool.clone())));
    let file = json!({ "tools": [tool] });

    let summary = import_bytes(&store, file.to_string().as_bytes()).unwrap();

    assert_eq!(summary.requeued, 0);
    assert_eq!(store.get_queue().len(), 1);
  }

  #[test]
  fn test_malformed_import_changes_nothing() {
    let store = LocalStore::in_memory();
    store.save_entities(&[synced_tool("keep", "1")]);
    let before_tools = store.get_entities::<Tool>();
    let before_prefs = store.get_preferences();

    // valid tools, broken categories
    let file = json!({
      "tools": [],
      "categories": [{"name": 3}],
      "preferences": {"theme": "dark"}
    });
    let err = import_bytes(&store, file.to_string().as_bytes()).unwrap_err();

    assert!(matches!(
      err,
      ImportError::InvalidSection {
        section: "categories",
        ..
      }
    ));
    assert_eq!(store.get_entities::<Tool>(), before_tools);
    assert_eq!(store.get_preferences(), before_prefs);
    assert!(store.get_queue().is_empty());
  }

  #[test]
  fn test_rejects_non_object_and_invalid_json() {
    let store = LocalStore::in_memory();
    assert!(matches!(
      import_bytes(&store, b"[1, 2]"),
      Err(ImportError::NotAnObject)
    ));
    assert!(matches!(
      import_bytes(&store, b"{oops"),
      Err(ImportError::Parse(_))
    ));
  }

  #[test]
  fn test_synced_entity_without_id_is_rejected() {
    let store = LocalStore::in_memory();
    let mut tool = Tool::new("ghost");
    tool.meta.sync_status = SyncStatus::Synced;
    let file = json!({ "tools": [tool] });

    let err = import_bytes(&store, file.to_string().as_bytes()).unwrap_err();
    assert!(matches!(err, ImportError::SyncedWithoutId { .. }));
    assert!(store.get_entities::<Tool>().is_empty());
  }
}
