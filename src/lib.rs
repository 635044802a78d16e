//! Offline-first sync core for a tools/categories catalog.
//!
//! Local mutations land in a persistent [`store::LocalStore`] and an offline
//! action queue first; a [`sync::SyncOrchestrator`] replays the queue through
//! a [`remote::RemoteQueryLayer`] once the remote is reachable.

pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod queue;
pub mod remote;
pub mod store;
pub mod sync;
pub mod transfer;
