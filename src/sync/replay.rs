//! Replay of queued actions against the remote layer.
//!
//! A failed drain leaves the whole queue in place, so every action may be
//! replayed again after it already succeeded once. Handlers are therefore
//! idempotent per action:
//! - create first looks the row up by `local_id` and treats an existing row as done
//! - update writes the full snapshot, so repeating it converges; a row that
//!   vanished remotely is recorded as a conflict instead of failing the drain
//! - delete treats a missing row, or an entity that never reached the remote, as done

use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::error::{RemoteError, SyncError};
use crate::model::remote_types::row_id;
use crate::model::CatalogEntity;
use crate::queue::{ActionOp, EntityRef, Mutation, OfflineAction};
use crate::remote::RemoteQueryLayer;

/// Replays actions in order, remembering the remote id assigned to each local id.
pub(crate) struct Replayer<'a> {
  remote: &'a RemoteQueryLayer,
  resolved: HashMap<String, String>,
  conflicts: HashSet<String>,
}

/// What a drain learned about the entities it touched.
#[derive(Debug, Default)]
pub(crate) struct ReplayOutcome {
  /// Local id → remote id for every entity created or looked up
  pub resolved: HashMap<String, String>,
  /// Local ids whose update found no remote row
  pub conflicts: HashSet<String>,
}

impl<'a> Replayer<'a> {
  pub(crate) fn new(remote: &'a RemoteQueryLayer) -> Self {
    Self {
      remote,
      resolved: HashMap::new(),
      conflicts: HashSet::new(),
    }
  }

  pub(crate) fn into_outcome(self) -> ReplayOutcome {
    ReplayOutcome {
      resolved: self.resolved,
      conflicts: self.conflicts,
    }
  }

  pub(crate) async fn replay(&mut self, action: &OfflineAction) -> Result<(), SyncError> {
    match &action.op {
      ActionOp::Tool(mutation) => self.apply(action, mutation).await,
      ActionOp::Category(mutation) => self.apply(action, mutation).await,
    }
  }

  async fn apply<E: CatalogEntity>(
    &mut self,
    action: &OfflineAction,
    mutation: &Mutation<E>,
  ) -> Result<(), SyncError> {
    let table = E::KIND.table();
    let wrap = |source: RemoteError| SyncError::Replay {
      action_id: action.id.clone(),
      action: mutation.name(),
      entity: E::KIND.tag(),
      source,
    };

    match mutation {
      Mutation::Create(entity) => {
        let local_id = &entity.meta().local_id;
        let row = match self
          .remote
          .find_one(table, "local_id", local_id)
          .await
          .map_err(wrap)?
        {
          Some(existing) => {
            debug!(table, local_id = %local_id, "create already applied remotely");
            existing
          }
          None => self
            .remote
            .create(table, entity.to_remote_record())
            .await
            .map_err(wrap)?,
        };

        let id = row_id(&row).ok_or_else(|| {
          wrap(RemoteError::InvalidResponse(format!(
            "{} row for {} has no id",
            table, local_id
          )))
        })?;
        self.resolved.insert(local_id.clone(), id);
      }
      Mutation::Update(entity) => {
        let meta = entity.meta();
        let id = self
          .resolve::<E>(meta.id.as_deref(), &meta.local_id)
          .await
          .map_err(wrap)?
          .ok_or_else(|| SyncError::UnresolvedEntity {
            entity: E::KIND.tag(),
            local_id: meta.local_id.clone(),
            action: "update",
          })?;
        match self.remote.update(table, &id, entity.to_remote_record()).await {
          Ok(_) => {}
          Err(e) if e.is_not_found() => {
            warn!(table, id = %id, local_id = %meta.local_id, "updated row was deleted remotely");
            self.conflicts.insert(meta.local_id.clone());
          }
          Err(e) => return Err(wrap(e)),
        }
      }
      Mutation::Delete(EntityRef { id, local_id }) => {
        let Some(id) = self.resolve::<E>(id.as_deref(), local_id).await.map_err(wrap)? else {
          debug!(table, local_id = %local_id, "deleted entity never reached the remote");
          return Ok(());
        };
        match self.remote.delete(table, &id).await {
          Ok(_) => {}
          Err(e) if e.is_not_found() => {
            debug!(table, id = %id, "row already deleted remotely");
          }
          Err(e) => return Err(wrap(e)),
        }
      }
    }
    Ok(())
  }

  /// Remote id for an entity: its own, one assigned earlier in this drain,
  /// or one found by `local_id` on the remote.
  async fn resolve<E: CatalogEntity>(
    &mut self,
    id: Option<&str>,
    local_id: &str,
  ) -> Result<Option<String>, RemoteError> {
    if let Some(id) = id {
      return Ok(Some(id.to_string()));
    }
    if let Some(id) = self.resolved.get(local_id) {
      return Ok(Some(id.clone()));
    }

    let found = self
      .remote
      .find_one(E::KIND.table(), "local_id", local_id)
      .await?
      .and_then(|row| row_id(&row));
    if let Some(id) = &found {
      self.resolved.insert(local_id.to_string(), id.clone());
    }
    Ok(found)
  }
}
