//! Row builders shared by unit tests.

use chrono::Utc;
use synctrack_core::{
    ChangesetId, Entity, EntityAction, EntityId, EntityStatus, File, FileId, FileStatus,
    GeometryType, SyncId, SyncRun, SyncStatus,
};

pub fn sync_row(total_files: i32) -> SyncRun {
    SyncRun {
        id: SyncId::new(),
        layer_id: 7,
        geometry_type: GeometryType::Polygon,
        dump_date: Utc::now(),
        start_date: Utc::now(),
        end_date: None,
        status: SyncStatus::InProgress,
        total_files: Some(total_files),
        is_full: false,
        base_sync_id: None,
        run_number: 0,
        metadata: None,
    }
}

pub fn file_row(sync_id: SyncId, total_entities: Option<i32>) -> File {
    File {
        file_id: FileId::new(),
        sync_id,
        status: FileStatus::InProgress,
        total_entities,
        start_date: Utc::now(),
        end_date: None,
    }
}

pub fn entity_row(id: &str, file_id: FileId, status: EntityStatus) -> Entity {
    Entity {
        entity_id: EntityId::new(id),
        file_id,
        changeset_id: None,
        status,
        action: EntityAction::Create,
        fail_reason: None,
    }
}

pub fn entity_in_changeset(id: &str, file_id: FileId, changeset_id: ChangesetId) -> Entity {
    Entity {
        changeset_id: Some(changeset_id),
        ..entity_row(id, file_id, EntityStatus::InProgress)
    }
}
