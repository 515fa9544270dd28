//! Storage interfaces, one per aggregate.
//!
//! Every method runs inside the unit of work it is called on; nothing is
//! visible to other transactions until [`UnitOfWork::commit`]. Dropping a unit
//! of work without committing rolls it back.
//!
//! The closure predicates (`try_close_file`, `try_close_sync`) are single
//! compare-and-set statements: the count comparison and the status transition
//! happen in one step, so only one concurrent caller can observe "count
//! matches" and perform the transition.

use async_trait::async_trait;

use synctrack_core::{
    Changeset, ChangesetId, Entity, EntityHistory, EntityId, EntityPatch, File, FileId, FileStatus,
    SyncId, SyncRun, TrackerResult,
};

use crate::transaction::IsolationLevel;

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryDatabase;
pub use postgres::{PgDatabase, PgUnitOfWork};

#[async_trait]
pub trait SyncStore: Send {
    async fn find_sync(&mut self, sync_id: SyncId) -> TrackerResult<Option<SyncRun>>;

    /// Fails with `NotFound` when `base_sync_id` is set but missing, and with
    /// `AlreadyExists` on a duplicate id.
    async fn insert_sync(&mut self, sync: &SyncRun) -> TrackerResult<()>;

    /// Close `sync_id` iff it is still closable and its completed file count
    /// equals its declared total. On success the most recent rerun chained to
    /// it (highest run number) is closed too if it is still in progress.
    ///
    /// Returns the ids that transitioned: empty, the sync, or sync + rerun.
    async fn try_close_sync(&mut self, sync_id: SyncId) -> TrackerResult<Vec<SyncId>>;

    /// Highest-numbered rerun chained to `base_sync_id`.
    async fn latest_rerun(&mut self, base_sync_id: SyncId) -> TrackerResult<Option<SyncRun>>;

    /// Shrink the declared file total after files were removed.
    async fn decrement_total_files(&mut self, sync_id: SyncId, by: u64) -> TrackerResult<()>;
}

#[async_trait]
pub trait FileStore: Send {
    async fn find_file(&mut self, file_id: FileId) -> TrackerResult<Option<File>>;

    async fn insert_file(&mut self, file: &File) -> TrackerResult<()>;

    /// Close `file_id` iff it is in progress, has a declared total, and the
    /// number of its entities in a resolved status equals that total.
    ///
    /// Returns the owning sync id on closure.
    async fn try_close_file(&mut self, file_id: FileId) -> TrackerResult<Option<SyncId>>;

    /// Delete files of `sync_id` that own no entities. Returns how many.
    async fn delete_empty_files(&mut self, sync_id: SyncId) -> TrackerResult<u64>;

    /// Reopen files of `sync_id` that still own a `not_synced` entity.
    async fn reopen_files_with_not_synced(&mut self, sync_id: SyncId) -> TrackerResult<u64>;
}

#[async_trait]
pub trait EntityStore: Send {
    async fn find_entity(
        &mut self,
        entity_id: &EntityId,
        file_id: FileId,
    ) -> TrackerResult<Option<Entity>>;

    async fn insert_entities(&mut self, entities: &[Entity]) -> TrackerResult<()>;

    async fn patch_entity(
        &mut self,
        entity_id: &EntityId,
        file_id: FileId,
        patch: &EntityPatch,
    ) -> TrackerResult<()>;

    /// Set every entity of the given changesets to `completed`.
    async fn mark_changeset_entities_completed(
        &mut self,
        changeset_ids: &[ChangesetId],
    ) -> TrackerResult<u64>;

    /// Distinct files owning at least one entity of the given changesets,
    /// restricted to files currently in one of `file_statuses`.
    async fn find_files_for_changesets(
        &mut self,
        changeset_ids: &[ChangesetId],
        file_statuses: &[FileStatus],
    ) -> TrackerResult<Vec<FileId>>;

    /// Reset unfinished entities of `sync_id` to `in_rerun`, clearing their
    /// changeset and failure reason.
    async fn reset_entities_for_rerun(&mut self, sync_id: SyncId) -> TrackerResult<u64>;
}

#[async_trait]
pub trait ChangesetStore: Send {
    async fn find_changeset(&mut self, changeset_id: ChangesetId)
    -> TrackerResult<Option<Changeset>>;

    async fn insert_changeset(&mut self, changeset: &Changeset) -> TrackerResult<()>;
}

#[async_trait]
pub trait EntityHistoryStore: Send {
    /// Archive every entity of `base_sync_id` that has not already been
    /// archived as `completed`, attributing the rows to `rerun_id`.
    ///
    /// Rows are keyed by (entity, file, sync); re-archiving the same
    /// generation inserts nothing.
    async fn archive_entities(&mut self, base_sync_id: SyncId, rerun_id: SyncId)
    -> TrackerResult<u64>;

    async fn history_for_sync(&mut self, sync_id: SyncId) -> TrackerResult<Vec<EntityHistory>>;
}

/// A transaction spanning every store.
#[async_trait]
pub trait UnitOfWork:
    SyncStore + FileStore + EntityStore + ChangesetStore + EntityHistoryStore + Send + Sized
{
    async fn commit(self) -> TrackerResult<()>;
}

/// Opens units of work at a given isolation level.
#[async_trait]
pub trait TransactionSource: Send + Sync + 'static {
    type Uow: UnitOfWork + 'static;

    async fn begin(&self, isolation: IsolationLevel) -> TrackerResult<Self::Uow>;
}
