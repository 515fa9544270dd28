//! `synctrack-core` — domain model of the sync completion tracker.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! identifiers, the status model of the sync → file → entity hierarchy and
//! the error taxonomy shared by every layer.

pub mod error;
pub mod id;
pub mod model;

pub use error::{ErrorKind, TrackerError, TrackerResult};
pub use id::{ChangesetId, EntityId, FileId, SyncId};
pub use model::{
    Changeset, Entity, EntityAction, EntityHistory, EntityPatch, EntityStatus, File, FileStatus,
    GeometryType, SyncRun, SyncStatus,
};
