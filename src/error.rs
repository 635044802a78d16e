//! Error types shared across the sync core.

use thiserror::Error;

/// Failures of the local key-value backend.
///
/// These never leave [`crate::store::LocalStore`]; they are logged and
/// replaced by a safe default at that boundary.
#[derive(Debug, Error)]
pub enum StorageError {
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("storage lock poisoned")]
  LockPoisoned,
}

/// Errors returned by the remote query layer and its backends.
#[derive(Debug, Error)]
pub enum RemoteError {
  #[error("http error: {0}")]
  Http(#[from] reqwest::Error),

  #[error("remote returned {status}: {body}")]
  Status { status: u16, body: String },

  #[error("no row with id {id} in {table}")]
  NotFound { table: String, id: String },

  #[error("invalid response: {0}")]
  InvalidResponse(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("invalid url: {0}")]
  Url(#[from] url::ParseError),

  #[error("invalid channel filter `{0}`, expected `column=eq.value`")]
  InvalidFilter(String),

  #[error("{0}")]
  Rejected(String),
}

impl RemoteError {
  pub fn is_not_found(&self) -> bool {
    matches!(self, RemoteError::NotFound { .. })
  }
}

/// Errors surfaced by the sync orchestrator.
#[derive(Debug, Error)]
pub enum SyncError {
  #[error("cannot sync while offline")]
  Offline,

  #[error("replay of {entity} {action} ({action_id}) failed: {source}")]
  Replay {
    action_id: String,
    action: &'static str,
    entity: &'static str,
    #[source]
    source: RemoteError,
  },

  #[error("{entity} {local_id} has no remote id to {action}")]
  UnresolvedEntity {
    entity: &'static str,
    local_id: String,
    action: &'static str,
  },

  #[error("could not queue {entity} {action}; the change was not applied")]
  NotQueued {
    entity: &'static str,
    action: &'static str,
  },
}

/// Errors from importing a local-state export file.
#[derive(Debug, Error)]
pub enum ImportError {
  #[error("failed to read import file: {0}")]
  Io(#[from] std::io::Error),

  #[error("import file is not valid JSON: {0}")]
  Parse(#[from] serde_json::Error),

  #[error("import file must contain a JSON object at the top level")]
  NotAnObject,

  #[error("section `{section}` is malformed: {source}")]
  InvalidSection {
    section: &'static str,
    #[source]
    source: serde_json::Error,
  },

  #[error("a {entity} entry has an empty local id")]
  MissingLocalId { entity: &'static str },

  #[error("{entity} {local_id} is marked synced but has no remote id")]
  SyncedWithoutId {
    entity: &'static str,
    local_id: String,
  },
}

/// Errors from writing a local-state export file.
#[derive(Debug, Error)]
pub enum ExportError {
  #[error("failed to write export file: {0}")]
  Io(#[from] std::io::Error),

  #[error("failed to serialize export: {0}")]
  Serialization(#[from] serde_json::Error),
}
