//! Catalog domain types cached locally and replayed to the remote.

mod entity;
mod preferences;
pub mod remote_types;
mod types;

pub use entity::{CatalogEntity, EntityKind, EntityMeta, SyncStatus};
pub use preferences::{DefaultView, PreferencesPatch, Theme, UserPreferences};
pub use types::{Category, Tool};
