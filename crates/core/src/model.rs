//! Status model and row types of the sync hierarchy.
//!
//! ```text
//! Sync ──< File ──< Entity >── Changeset
//!   └──< Sync (reruns, via base_sync_id)
//! ```
//!
//! A file closes when every owned entity is `completed` or `not_synced`; a
//! sync closes when every declared file is `completed`. Changesets are not
//! part of the hierarchy: closing one marks its entities completed, after
//! which file and sync closure are re-evaluated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TrackerError;
use crate::id::{ChangesetId, EntityId, FileId, SyncId};

macro_rules! text_enum {
    ($t:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $t {
            pub const ALL: &'static [$t] = &[$($t::$variant),+];

            /// Storage representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($t::$variant => $text),+
                }
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl core::str::FromStr for $t {
            type Err = TrackerError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($t::$variant),)+
                    other => Err(TrackerError::InvalidPayload(format!(
                        "unknown {} '{}'",
                        stringify!($t),
                        other
                    ))),
                }
            }
        }
    };
}

/// Status of a sync attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    InProgress,
    Completed,
    Failed,
}

text_enum!(SyncStatus {
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
});

impl SyncStatus {
    /// A sync in one of these states can still be resolved by the closure
    /// engine. A failed sync becomes completed once all of its work finishes,
    /// which is how a rerun resolves its base.
    pub fn is_closable(self) -> bool {
        matches!(self, SyncStatus::InProgress | SyncStatus::Failed)
    }
}

/// Status of a file.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    InProgress,
    Completed,
    Failed,
}

text_enum!(FileStatus {
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
});

/// Status of an entity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    InProgress,
    Completed,
    NotSynced,
    Failed,
    InRerun,
}

text_enum!(EntityStatus {
    InProgress => "in_progress",
    Completed => "completed",
    NotSynced => "not_synced",
    Failed => "failed",
    InRerun => "in_rerun",
});

impl EntityStatus {
    /// Statuses that count towards closing the owning file.
    pub const RESOLVED: &'static [EntityStatus] = &[EntityStatus::Completed, EntityStatus::NotSynced];

    /// Statuses reset to `in_rerun` when a rerun is created.
    pub const RERUNNABLE: &'static [EntityStatus] = &[
        EntityStatus::InProgress,
        EntityStatus::NotSynced,
        EntityStatus::Failed,
    ];

    pub fn is_resolved(self) -> bool {
        Self::RESOLVED.contains(&self)
    }
}

/// What the sync did to an entity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityAction {
    Create,
    Modify,
    Delete,
}

text_enum!(EntityAction {
    Create => "create",
    Modify => "modify",
    Delete => "delete",
});

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeometryType {
    Point,
    Line,
    Polygon,
}

text_enum!(GeometryType {
    Point => "point",
    Line => "line",
    Polygon => "polygon",
});

/// One synchronization attempt for a (layer, geometry kind) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: SyncId,
    pub layer_id: i32,
    pub geometry_type: GeometryType,
    pub dump_date: DateTime<Utc>,
    pub start_date: DateTime<Utc>,
    /// Set once, by the closure engine.
    pub end_date: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub total_files: Option<i32>,
    pub is_full: bool,
    /// Non-null iff this sync is a rerun.
    pub base_sync_id: Option<SyncId>,
    /// 0 for a root sync, >= 1 for reruns.
    pub run_number: i32,
    pub metadata: Option<serde_json::Value>,
}

impl SyncRun {
    pub fn is_rerun(&self) -> bool {
        self.base_sync_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub file_id: FileId,
    pub sync_id: SyncId,
    pub status: FileStatus,
    /// A file without a declared total can never close.
    pub total_entities: Option<i32>,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: EntityId,
    pub file_id: FileId,
    pub changeset_id: Option<ChangesetId>,
    pub status: EntityStatus,
    pub action: EntityAction,
    pub fail_reason: Option<String>,
}

/// Partial update of an entity. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityPatch {
    pub status: Option<EntityStatus>,
    pub changeset_id: Option<ChangesetId>,
    pub action: Option<EntityAction>,
    pub fail_reason: Option<String>,
}

impl EntityPatch {
    pub fn status(status: EntityStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn changeset(changeset_id: ChangesetId) -> Self {
        Self {
            changeset_id: Some(changeset_id),
            ..Default::default()
        }
    }

    /// Apply the patch to an entity in place.
    pub fn apply(&self, entity: &mut Entity) {
        if let Some(status) = self.status {
            entity.status = status;
        }
        if let Some(changeset_id) = self.changeset_id {
            entity.changeset_id = Some(changeset_id);
        }
        if let Some(action) = self.action {
            entity.action = action;
        }
        if let Some(reason) = &self.fail_reason {
            entity.fail_reason = Some(reason.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset {
    pub changeset_id: ChangesetId,
    /// Identifier assigned by the upstream system once the changeset is applied.
    pub osm_id: Option<i64>,
}

/// Archived state of an entity as of one sync attempt. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityHistory {
    pub entity_id: EntityId,
    pub file_id: FileId,
    /// The rerun the row is attributed to.
    pub sync_id: SyncId,
    pub base_sync_id: Option<SyncId>,
    pub changeset_id: Option<ChangesetId>,
    pub status: EntityStatus,
    pub action: EntityAction,
    pub fail_reason: Option<String>,
}

impl EntityHistory {
    /// Snapshot `entity` into a history row for `sync_id`.
    pub fn archive(entity: &Entity, sync_id: SyncId, base_sync_id: SyncId) -> Self {
        Self {
            entity_id: entity.entity_id.clone(),
            file_id: entity.file_id,
            sync_id,
            base_sync_id: Some(base_sync_id),
            changeset_id: entity.changeset_id,
            status: entity.status,
            action: entity.action,
            fail_reason: entity.fail_reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_parse_from_storage_text() {
        for status in EntityStatus::ALL {
            assert_eq!(status.as_str().parse::<EntityStatus>().unwrap(), *status);
        }
        assert!("inprogress".parse::<SyncStatus>().is_err());
    }

    #[test]
    fn resolved_entity_statuses() {
        assert!(EntityStatus::Completed.is_resolved());
        assert!(EntityStatus::NotSynced.is_resolved());
        assert!(!EntityStatus::InRerun.is_resolved());
        assert!(!EntityStatus::Failed.is_resolved());
    }

    #[test]
    fn patch_only_touches_given_fields() {
        let mut entity = Entity {
            entity_id: EntityId::new("node/1"),
            file_id: FileId::new(),
            changeset_id: None,
            status: EntityStatus::InProgress,
            action: EntityAction::Create,
            fail_reason: None,
        };

        let changeset = ChangesetId::new();
        EntityPatch::changeset(changeset).apply(&mut entity);

        assert_eq!(entity.changeset_id, Some(changeset));
        assert_eq!(entity.status, EntityStatus::InProgress);
        assert_eq!(entity.action, EntityAction::Create);
    }

    #[test]
    fn completed_syncs_are_not_closable() {
        assert!(SyncStatus::InProgress.is_closable());
        assert!(SyncStatus::Failed.is_closable());
        assert!(!SyncStatus::Completed.is_closable());
    }
}
