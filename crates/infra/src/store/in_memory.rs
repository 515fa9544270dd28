//! In-memory storage adapter.
//!
//! A unit of work holds the database lock for its whole lifetime and works
//! on a private copy of the state, so transactions are fully serialized and
//! a dropped unit of work leaves nothing behind. Intended for tests and
//! local runs; commit failures can be injected with
//! [`InMemoryDatabase::fail_next_commits`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use synctrack_core::{
    Changeset, ChangesetId, Entity, EntityHistory, EntityId, EntityPatch, EntityStatus, File,
    FileId, FileStatus, SyncId, SyncRun, SyncStatus, TrackerError, TrackerResult,
};

use super::{
    ChangesetStore, EntityHistoryStore, EntityStore, FileStore, SyncStore, TransactionSource,
    UnitOfWork,
};
use crate::transaction::IsolationLevel;

#[derive(Debug, Clone, Default)]
struct State {
    syncs: HashMap<SyncId, SyncRun>,
    files: HashMap<FileId, File>,
    entities: BTreeMap<(FileId, EntityId), Entity>,
    changesets: HashMap<ChangesetId, Changeset>,
    history: Vec<EntityHistory>,
}

impl State {
    fn files_of(&self, sync_id: SyncId) -> impl Iterator<Item = &File> {
        self.files.values().filter(move |f| f.sync_id == sync_id)
    }

    fn entities_of(&self, file_id: FileId) -> impl Iterator<Item = &Entity> {
        self.entities
            .range((file_id, EntityId::new(""))..)
            .take_while(move |((f, _), _)| *f == file_id)
            .map(|(_, e)| e)
    }

    fn file_ids_of(&self, sync_id: SyncId) -> BTreeSet<FileId> {
        self.files_of(sync_id).map(|f| f.file_id).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabase {
    state: Arc<Mutex<State>>,
    failing_commits: Arc<AtomicU32>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with a transaction failure.
    pub fn fail_next_commits(&self, n: u32) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    pub async fn sync_row(&self, sync_id: SyncId) -> Option<SyncRun> {
        self.state.lock().await.syncs.get(&sync_id).cloned()
    }

    pub async fn file_row(&self, file_id: FileId) -> Option<File> {
        self.state.lock().await.files.get(&file_id).cloned()
    }

    pub async fn entity_row(&self, entity_id: &EntityId, file_id: FileId) -> Option<Entity> {
        self.state
            .lock()
            .await
            .entities
            .get(&(file_id, entity_id.clone()))
            .cloned()
    }

    pub async fn history_rows(&self) -> Vec<EntityHistory> {
        self.state.lock().await.history.clone()
    }
}

#[async_trait]
impl TransactionSource for InMemoryDatabase {
    type Uow = InMemoryUnitOfWork;

    async fn begin(&self, _isolation: IsolationLevel) -> TrackerResult<Self::Uow> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(InMemoryUnitOfWork {
            guard,
            working,
            failing_commits: self.failing_commits.clone(),
        })
    }
}

#[derive(Debug)]
pub struct InMemoryUnitOfWork {
    guard: OwnedMutexGuard<State>,
    working: State,
    failing_commits: Arc<AtomicU32>,
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn commit(self) -> TrackerResult<()> {
        let injected = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TrackerError::transaction_failure(
                "could not serialize access due to concurrent update",
            ));
        }

        let InMemoryUnitOfWork {
            mut guard, working, ..
        } = self;
        *guard = working;
        Ok(())
    }
}

#[async_trait]
impl SyncStore for InMemoryUnitOfWork {
    async fn find_sync(&mut self, sync_id: SyncId) -> TrackerResult<Option<SyncRun>> {
        Ok(self.working.syncs.get(&sync_id).cloned())
    }

    async fn insert_sync(&mut self, sync: &SyncRun) -> TrackerResult<()> {
        if let Some(base) = sync.base_sync_id {
            if !self.working.syncs.contains_key(&base) {
                return Err(TrackerError::not_found(format!("base sync {base}")));
            }
        }
        if self.working.syncs.contains_key(&sync.id) {
            return Err(TrackerError::already_exists(format!("sync {}", sync.id)));
        }
        self.working.syncs.insert(sync.id, sync.clone());
        Ok(())
    }

    async fn try_close_sync(&mut self, sync_id: SyncId) -> TrackerResult<Vec<SyncId>> {
        let completed_files = self
            .working
            .files_of(sync_id)
            .filter(|f| f.status == FileStatus::Completed)
            .count() as i32;

        let now = Utc::now();
        match self.working.syncs.get_mut(&sync_id) {
            Some(sync)
                if sync.status.is_closable() && sync.total_files == Some(completed_files) =>
            {
                sync.status = SyncStatus::Completed;
                sync.end_date = Some(now);
            }
            _ => return Ok(Vec::new()),
        }

        let mut closed = vec![sync_id];
        let latest = self
            .working
            .syncs
            .values_mut()
            .filter(|s| s.base_sync_id == Some(sync_id))
            .max_by_key(|s| s.run_number);
        if let Some(rerun) = latest {
            if rerun.status == SyncStatus::InProgress {
                rerun.status = SyncStatus::Completed;
                rerun.end_date = Some(now);
                closed.push(rerun.id);
            }
        }
        Ok(closed)
    }

    async fn latest_rerun(&mut self, base_sync_id: SyncId) -> TrackerResult<Option<SyncRun>> {
        Ok(self
            .working
            .syncs
            .values()
            .filter(|s| s.base_sync_id == Some(base_sync_id))
            .max_by_key(|s| s.run_number)
            .cloned())
    }

    async fn decrement_total_files(&mut self, sync_id: SyncId, by: u64) -> TrackerResult<()> {
        let sync = self
            .working
            .syncs
            .get_mut(&sync_id)
            .ok_or_else(|| TrackerError::not_found(format!("sync {sync_id}")))?;
        if let Some(total) = sync.total_files.as_mut() {
            *total = total
                .saturating_sub(i32::try_from(by).unwrap_or(i32::MAX))
                .max(0);
        }
        Ok(())
    }
}

#[async_trait]
impl FileStore for InMemoryUnitOfWork {
    async fn find_file(&mut self, file_id: FileId) -> TrackerResult<Option<File>> {
        Ok(self.working.files.get(&file_id).cloned())
    }

    async fn insert_file(&mut self, file: &File) -> TrackerResult<()> {
        if !self.working.syncs.contains_key(&file.sync_id) {
            return Err(TrackerError::not_found(format!("sync {}", file.sync_id)));
        }
        if self.working.files.contains_key(&file.file_id) {
            return Err(TrackerError::already_exists(format!("file {}", file.file_id)));
        }
        self.working.files.insert(file.file_id, file.clone());
        Ok(())
    }

    async fn try_close_file(&mut self, file_id: FileId) -> TrackerResult<Option<SyncId>> {
        let resolved = self
            .working
            .entities_of(file_id)
            .filter(|e| e.status.is_resolved())
            .count() as i32;

        match self.working.files.get_mut(&file_id) {
            Some(file)
                if file.status == FileStatus::InProgress
                    && file.total_entities == Some(resolved) =>
            {
                file.status = FileStatus::Completed;
                file.end_date = Some(Utc::now());
                Ok(Some(file.sync_id))
            }
            _ => Ok(None),
        }
    }

    async fn delete_empty_files(&mut self, sync_id: SyncId) -> TrackerResult<u64> {
        let empty: Vec<FileId> = self
            .working
            .files_of(sync_id)
            .filter(|f| self.working.entities_of(f.file_id).next().is_none())
            .map(|f| f.file_id)
            .collect();
        for file_id in &empty {
            self.working.files.remove(file_id);
        }
        Ok(empty.len() as u64)
    }

    async fn reopen_files_with_not_synced(&mut self, sync_id: SyncId) -> TrackerResult<u64> {
        let reopen: Vec<FileId> = self
            .working
            .files_of(sync_id)
            .filter(|f| f.status != FileStatus::InProgress)
            .filter(|f| {
                self.working
                    .entities_of(f.file_id)
                    .any(|e| e.status == EntityStatus::NotSynced)
            })
            .map(|f| f.file_id)
            .collect();
        for file_id in &reopen {
            if let Some(file) = self.working.files.get_mut(file_id) {
                file.status = FileStatus::InProgress;
                file.end_date = None;
            }
        }
        Ok(reopen.len() as u64)
    }
}

#[async_trait]
impl EntityStore for InMemoryUnitOfWork {
    async fn find_entity(
        &mut self,
        entity_id: &EntityId,
        file_id: FileId,
    ) -> TrackerResult<Option<Entity>> {
        Ok(self
            .working
            .entities
            .get(&(file_id, entity_id.clone()))
            .cloned())
    }

    async fn insert_entities(&mut self, entities: &[Entity]) -> TrackerResult<()> {
        let mut seen = BTreeSet::new();
        for entity in entities {
            if !self.working.files.contains_key(&entity.file_id) {
                return Err(TrackerError::not_found(format!("file {}", entity.file_id)));
            }
            if let Some(changeset_id) = entity.changeset_id {
                if !self.working.changesets.contains_key(&changeset_id) {
                    return Err(TrackerError::not_found(format!("changeset {changeset_id}")));
                }
            }
            let key = (entity.file_id, entity.entity_id.clone());
            if self.working.entities.contains_key(&key) || !seen.insert(key) {
                return Err(TrackerError::already_exists(format!(
                    "entity {} in file {}",
                    entity.entity_id, entity.file_id
                )));
            }
        }
        for entity in entities {
            self.working
                .entities
                .insert((entity.file_id, entity.entity_id.clone()), entity.clone());
        }
        Ok(())
    }

    async fn patch_entity(
        &mut self,
        entity_id: &EntityId,
        file_id: FileId,
        patch: &EntityPatch,
    ) -> TrackerResult<()> {
        if let Some(changeset_id) = patch.changeset_id {
            if !self.working.changesets.contains_key(&changeset_id) {
                return Err(TrackerError::not_found(format!("changeset {changeset_id}")));
            }
        }
        let entity = self
            .working
            .entities
            .get_mut(&(file_id, entity_id.clone()))
            .ok_or_else(|| {
                TrackerError::not_found(format!("entity {entity_id} in file {file_id}"))
            })?;
        patch.apply(entity);
        Ok(())
    }

    async fn mark_changeset_entities_completed(
        &mut self,
        changeset_ids: &[ChangesetId],
    ) -> TrackerResult<u64> {
        let mut updated = 0;
        for entity in self.working.entities.values_mut() {
            let in_changeset = entity
                .changeset_id
                .is_some_and(|id| changeset_ids.contains(&id));
            if in_changeset && entity.status != EntityStatus::Completed {
                entity.status = EntityStatus::Completed;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn find_files_for_changesets(
        &mut self,
        changeset_ids: &[ChangesetId],
        file_statuses: &[FileStatus],
    ) -> TrackerResult<Vec<FileId>> {
        let files: BTreeSet<FileId> = self
            .working
            .entities
            .values()
            .filter(|e| e.changeset_id.is_some_and(|id| changeset_ids.contains(&id)))
            .filter(|e| {
                self.working
                    .files
                    .get(&e.file_id)
                    .is_some_and(|f| file_statuses.contains(&f.status))
            })
            .map(|e| e.file_id)
            .collect();
        Ok(files.into_iter().collect())
    }

    async fn reset_entities_for_rerun(&mut self, sync_id: SyncId) -> TrackerResult<u64> {
        let files = self.working.file_ids_of(sync_id);
        let mut updated = 0;
        for entity in self.working.entities.values_mut() {
            if files.contains(&entity.file_id) && EntityStatus::RERUNNABLE.contains(&entity.status)
            {
                entity.status = EntityStatus::InRerun;
                entity.changeset_id = None;
                entity.fail_reason = None;
                updated += 1;
            }
        }
        Ok(updated)
    }
}

#[async_trait]
impl ChangesetStore for InMemoryUnitOfWork {
    async fn find_changeset(
        &mut self,
        changeset_id: ChangesetId,
    ) -> TrackerResult<Option<Changeset>> {
        Ok(self.working.changesets.get(&changeset_id).cloned())
    }

    async fn insert_changeset(&mut self, changeset: &Changeset) -> TrackerResult<()> {
        if self.working.changesets.contains_key(&changeset.changeset_id) {
            return Err(TrackerError::already_exists(format!(
                "changeset {}",
                changeset.changeset_id
            )));
        }
        self.working
            .changesets
            .insert(changeset.changeset_id, changeset.clone());
        Ok(())
    }
}

#[async_trait]
impl EntityHistoryStore for InMemoryUnitOfWork {
    async fn archive_entities(
        &mut self,
        base_sync_id: SyncId,
        rerun_id: SyncId,
    ) -> TrackerResult<u64> {
        let files = self.working.file_ids_of(base_sync_id);
        let history = &self.working.history;

        let rows: Vec<EntityHistory> = self
            .working
            .entities
            .values()
            .filter(|e| files.contains(&e.file_id))
            .filter(|e| {
                !history.iter().any(|h| {
                    h.entity_id == e.entity_id
                        && h.file_id == e.file_id
                        && (h.status == EntityStatus::Completed || h.sync_id == rerun_id)
                })
            })
            .map(|e| EntityHistory::archive(e, rerun_id, base_sync_id))
            .collect();

        let inserted = rows.len() as u64;
        self.working.history.extend(rows);
        Ok(inserted)
    }

    async fn history_for_sync(&mut self, sync_id: SyncId) -> TrackerResult<Vec<EntityHistory>> {
        Ok(self
            .working
            .history
            .iter()
            .filter(|h| h.sync_id == sync_id)
            .cloned()
            .collect())
    }
}
