//! Postgres storage adapter.
//!
//! Every store method runs on the transaction held by a [`PgUnitOfWork`].
//! The closure predicates are single statements whose count comparison and
//! status transition happen together; at `SERIALIZABLE` a concurrent writer
//! that would invalidate the count makes one side fail with `40001`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | TrackerError |
//! |------------|----------------------|--------------|
//! | Database (serialization failure) | `40001` | `TransactionFailure` |
//! | Database (deadlock detected) | `40P01` | `TransactionFailure` |
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (foreign key violation) | `23503` | `NotFound` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{instrument, Span};
use uuid::Uuid;

use synctrack_core::{
    Changeset, ChangesetId, Entity, EntityHistory, EntityId, EntityPatch, EntityStatus, File,
    FileId, FileStatus, SyncId, SyncRun, TrackerError, TrackerResult,
};

use super::{
    ChangesetStore, EntityHistoryStore, EntityStore, FileStore, SyncStore, TransactionSource,
    UnitOfWork,
};
use crate::transaction::IsolationLevel;

const SCHEMA: &str = include_str!("../../migrations/0001_sync_tracking.sql");

/// Process-wide handle on the Postgres pool.
#[derive(Debug, Clone)]
pub struct PgDatabase {
    pool: Arc<PgPool>,
}

impl PgDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> TrackerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the schema if it is not there yet.
    pub async fn migrate(&self) -> TrackerResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    pub async fn ping(&self) -> TrackerResult<()> {
        sqlx::query("SELECT 1")
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ping", e))?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl TransactionSource for PgDatabase {
    type Uow = PgUnitOfWork;

    #[instrument(skip(self), fields(isolation = isolation.as_sql()), err)]
    async fn begin(&self, isolation: IsolationLevel) -> TrackerResult<Self::Uow> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let set_isolation = format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.as_sql());
        sqlx::query(&set_isolation)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_isolation", e))?;

        Ok(PgUnitOfWork { tx })
    }
}

/// An open Postgres transaction. Rolled back on drop unless committed.
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn commit(self) -> TrackerResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }
}

#[async_trait]
impl SyncStore for PgUnitOfWork {
    async fn find_sync(&mut self, sync_id: SyncId) -> TrackerResult<Option<SyncRun>> {
        let row = sqlx::query(
            r#"
            SELECT id, layer_id, geometry_type, dump_date, start_date, end_date, status,
                   total_files, is_full, base_sync_id, run_number, metadata
            FROM sync
            WHERE id = $1
            "#,
        )
        .bind(sync_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find_sync", e))?;

        row.map(|r| sync_from_row(&r)).transpose()
    }

    #[instrument(skip(self, sync), fields(sync_id = %sync.id, base_sync_id = ?sync.base_sync_id), err)]
    async fn insert_sync(&mut self, sync: &SyncRun) -> TrackerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync (
                id, layer_id, geometry_type, dump_date, start_date, end_date, status,
                total_files, is_full, base_sync_id, run_number, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(sync.id.as_uuid())
        .bind(sync.layer_id)
        .bind(sync.geometry_type.as_str())
        .bind(sync.dump_date)
        .bind(sync.start_date)
        .bind(sync.end_date)
        .bind(sync.status.as_str())
        .bind(sync.total_files)
        .bind(sync.is_full)
        .bind(sync.base_sync_id.map(Uuid::from))
        .bind(sync.run_number)
        .bind(&sync.metadata)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_sync", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(sync_id = %sync_id, closed = tracing::field::Empty), err)]
    async fn try_close_sync(&mut self, sync_id: SyncId) -> TrackerResult<Vec<SyncId>> {
        let rows = sqlx::query(
            r#"
            WITH closed_sync AS (
                UPDATE sync s
                SET status = 'completed', end_date = NOW()
                WHERE s.id = $1
                  AND s.status IN ('in_progress', 'failed')
                  AND s.total_files = (
                      SELECT COUNT(*) FROM file f
                      WHERE f.sync_id = s.id AND f.status = 'completed'
                  )
                RETURNING s.id
            ),
            latest_rerun AS (
                SELECT r.id, r.status
                FROM sync r
                WHERE r.base_sync_id = $1
                ORDER BY r.run_number DESC
                LIMIT 1
            ),
            closed_rerun AS (
                UPDATE sync r
                SET status = 'completed', end_date = NOW()
                FROM latest_rerun l
                WHERE r.id = l.id
                  AND l.status = 'in_progress'
                  AND EXISTS (SELECT 1 FROM closed_sync)
                RETURNING r.id
            )
            SELECT id, 0 AS ord FROM closed_sync
            UNION ALL
            SELECT id, 1 AS ord FROM closed_rerun
            ORDER BY ord
            "#,
        )
        .bind(sync_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("try_close_sync", e))?;

        let closed = rows
            .iter()
            .map(|r| r.try_get::<Uuid, _>("id").map(SyncId::from_uuid))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_sqlx_error("try_close_sync", e))?;
        Span::current().record("closed", closed.len());
        Ok(closed)
    }

    async fn latest_rerun(&mut self, base_sync_id: SyncId) -> TrackerResult<Option<SyncRun>> {
        let row = sqlx::query(
            r#"
            SELECT id, layer_id, geometry_type, dump_date, start_date, end_date, status,
                   total_files, is_full, base_sync_id, run_number, metadata
            FROM sync
            WHERE base_sync_id = $1
            ORDER BY run_number DESC
            LIMIT 1
            "#,
        )
        .bind(base_sync_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("latest_rerun", e))?;

        row.map(|r| sync_from_row(&r)).transpose()
    }

    async fn decrement_total_files(&mut self, sync_id: SyncId, by: u64) -> TrackerResult<()> {
        let by = i64::try_from(by)
            .map_err(|_| TrackerError::storage(format!("file count {by} out of range")))?;
        // An undeclared total stays undeclared.
        let result = sqlx::query(
            r#"
            UPDATE sync
            SET total_files = CASE
                WHEN total_files IS NULL THEN NULL
                ELSE GREATEST(total_files - $2, 0)::INTEGER
            END
            WHERE id = $1
            "#,
        )
        .bind(sync_id.as_uuid())
        .bind(by)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("decrement_total_files", e))?;

        if result.rows_affected() == 0 {
            return Err(TrackerError::not_found(format!("sync {sync_id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl FileStore for PgUnitOfWork {
    async fn find_file(&mut self, file_id: FileId) -> TrackerResult<Option<File>> {
        let row = sqlx::query(
            r#"
            SELECT file_id, sync_id, status, total_entities, start_date, end_date
            FROM file
            WHERE file_id = $1
            "#,
        )
        .bind(file_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find_file", e))?;

        row.map(|r| file_from_row(&r)).transpose()
    }

    #[instrument(skip(self, file), fields(file_id = %file.file_id, sync_id = %file.sync_id), err)]
    async fn insert_file(&mut self, file: &File) -> TrackerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO file (file_id, sync_id, status, total_entities, start_date, end_date)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(file.file_id.as_uuid())
        .bind(file.sync_id.as_uuid())
        .bind(file.status.as_str())
        .bind(file.total_entities)
        .bind(file.start_date)
        .bind(file.end_date)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_file", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(file_id = %file_id), err)]
    async fn try_close_file(&mut self, file_id: FileId) -> TrackerResult<Option<SyncId>> {
        let row = sqlx::query(
            r#"
            UPDATE file f
            SET status = 'completed', end_date = NOW()
            WHERE f.file_id = $1
              AND f.status = 'in_progress'
              AND f.total_entities IS NOT NULL
              AND f.total_entities = (
                  SELECT COUNT(*) FROM entity e
                  WHERE e.file_id = f.file_id
                    AND e.status IN ('completed', 'not_synced')
              )
            RETURNING f.sync_id
            "#,
        )
        .bind(file_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("try_close_file", e))?;

        row.map(|r| r.try_get::<Uuid, _>("sync_id").map(SyncId::from_uuid))
            .transpose()
            .map_err(|e| map_sqlx_error("try_close_file", e))
    }

    async fn delete_empty_files(&mut self, sync_id: SyncId) -> TrackerResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM file f
            WHERE f.sync_id = $1
              AND NOT EXISTS (SELECT 1 FROM entity e WHERE e.file_id = f.file_id)
            "#,
        )
        .bind(sync_id.as_uuid())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("delete_empty_files", e))?;
        Ok(result.rows_affected())
    }

    async fn reopen_files_with_not_synced(&mut self, sync_id: SyncId) -> TrackerResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE file f
            SET status = 'in_progress', end_date = NULL
            WHERE f.sync_id = $1
              AND f.status <> 'in_progress'
              AND EXISTS (
                  SELECT 1 FROM entity e
                  WHERE e.file_id = f.file_id AND e.status = 'not_synced'
              )
            "#,
        )
        .bind(sync_id.as_uuid())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("reopen_files_with_not_synced", e))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl EntityStore for PgUnitOfWork {
    async fn find_entity(
        &mut self,
        entity_id: &EntityId,
        file_id: FileId,
    ) -> TrackerResult<Option<Entity>> {
        let row = sqlx::query(
            r#"
            SELECT entity_id, file_id, changeset_id, status, action, fail_reason
            FROM entity
            WHERE entity_id = $1 AND file_id = $2
            "#,
        )
        .bind(entity_id.as_str())
        .bind(file_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find_entity", e))?;

        row.map(|r| entity_from_row(&r)).transpose()
    }

    #[instrument(skip(self, entities), fields(count = entities.len()), err)]
    async fn insert_entities(&mut self, entities: &[Entity]) -> TrackerResult<()> {
        for entity in entities {
            sqlx::query(
                r#"
                INSERT INTO entity (entity_id, file_id, changeset_id, status, action, fail_reason)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(entity.entity_id.as_str())
            .bind(entity.file_id.as_uuid())
            .bind(entity.changeset_id.map(Uuid::from))
            .bind(entity.status.as_str())
            .bind(entity.action.as_str())
            .bind(entity.fail_reason.as_deref())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_entities", e))?;
        }
        Ok(())
    }

    async fn patch_entity(
        &mut self,
        entity_id: &EntityId,
        file_id: FileId,
        patch: &EntityPatch,
    ) -> TrackerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE entity
            SET status = COALESCE($3, status),
                changeset_id = COALESCE($4, changeset_id),
                action = COALESCE($5, action),
                fail_reason = COALESCE($6, fail_reason)
            WHERE entity_id = $1 AND file_id = $2
            "#,
        )
        .bind(entity_id.as_str())
        .bind(file_id.as_uuid())
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.changeset_id.map(Uuid::from))
        .bind(patch.action.map(|a| a.as_str()))
        .bind(patch.fail_reason.as_deref())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("patch_entity", e))?;

        if result.rows_affected() == 0 {
            return Err(TrackerError::not_found(format!(
                "entity {entity_id} in file {file_id}"
            )));
        }
        Ok(())
    }

    #[instrument(skip(self, changeset_ids), fields(changesets = changeset_ids.len(), updated = tracing::field::Empty), err)]
    async fn mark_changeset_entities_completed(
        &mut self,
        changeset_ids: &[ChangesetId],
    ) -> TrackerResult<u64> {
        let ids: Vec<Uuid> = changeset_ids.iter().map(|id| Uuid::from(*id)).collect();
        let result = sqlx::query(
            r#"
            UPDATE entity
            SET status = 'completed'
            WHERE changeset_id = ANY($1) AND status <> 'completed'
            "#,
        )
        .bind(&ids)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("mark_changeset_entities_completed", e))?;

        Span::current().record("updated", result.rows_affected());
        Ok(result.rows_affected())
    }

    async fn find_files_for_changesets(
        &mut self,
        changeset_ids: &[ChangesetId],
        file_statuses: &[FileStatus],
    ) -> TrackerResult<Vec<FileId>> {
        let ids: Vec<Uuid> = changeset_ids.iter().map(|id| Uuid::from(*id)).collect();
        let statuses: Vec<&str> = file_statuses.iter().map(|s| s.as_str()).collect();

        let rows = sqlx::query(
            r#"
            SELECT DISTINCT e.file_id
            FROM entity e
            JOIN file f ON f.file_id = e.file_id
            WHERE e.changeset_id = ANY($1) AND f.status = ANY($2)
            ORDER BY e.file_id
            "#,
        )
        .bind(&ids)
        .bind(&statuses)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find_files_for_changesets", e))?;

        rows.iter()
            .map(|r| r.try_get::<Uuid, _>("file_id").map(FileId::from_uuid))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_sqlx_error("find_files_for_changesets", e))
    }

    async fn reset_entities_for_rerun(&mut self, sync_id: SyncId) -> TrackerResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE entity e
            SET status = 'in_rerun', changeset_id = NULL, fail_reason = NULL
            FROM file f
            WHERE f.file_id = e.file_id
              AND f.sync_id = $1
              AND e.status IN ('in_progress', 'not_synced', 'failed')
            "#,
        )
        .bind(sync_id.as_uuid())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("reset_entities_for_rerun", e))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ChangesetStore for PgUnitOfWork {
    async fn find_changeset(
        &mut self,
        changeset_id: ChangesetId,
    ) -> TrackerResult<Option<Changeset>> {
        let row = sqlx::query("SELECT changeset_id, osm_id FROM changeset WHERE changeset_id = $1")
            .bind(changeset_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("find_changeset", e))?;

        row.map(|r| {
            Ok(Changeset {
                changeset_id: ChangesetId::from_uuid(r.try_get("changeset_id")?),
                osm_id: r.try_get("osm_id")?,
            })
        })
        .transpose()
        .map_err(|e: sqlx::Error| map_sqlx_error("find_changeset", e))
    }

    async fn insert_changeset(&mut self, changeset: &Changeset) -> TrackerResult<()> {
        sqlx::query("INSERT INTO changeset (changeset_id, osm_id) VALUES ($1, $2)")
            .bind(changeset.changeset_id.as_uuid())
            .bind(changeset.osm_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_changeset", e))?;
        Ok(())
    }
}

#[async_trait]
impl EntityHistoryStore for PgUnitOfWork {
    #[instrument(skip(self), fields(base_sync_id = %base_sync_id, rerun_id = %rerun_id, archived = tracing::field::Empty), err)]
    async fn archive_entities(
        &mut self,
        base_sync_id: SyncId,
        rerun_id: SyncId,
    ) -> TrackerResult<u64> {
        let result = sqlx::query(
            r#"
            INSERT INTO entity_history (
                entity_id, file_id, sync_id, base_sync_id, changeset_id, status, action, fail_reason
            )
            SELECT e.entity_id, e.file_id, $2, $1, e.changeset_id, e.status, e.action, e.fail_reason
            FROM entity e
            JOIN file f ON f.file_id = e.file_id
            WHERE f.sync_id = $1
              AND NOT EXISTS (
                  SELECT 1 FROM entity_history h
                  WHERE h.entity_id = e.entity_id
                    AND h.file_id = e.file_id
                    AND h.status = 'completed'
              )
            ON CONFLICT (entity_id, file_id, sync_id) DO NOTHING
            "#,
        )
        .bind(base_sync_id.as_uuid())
        .bind(rerun_id.as_uuid())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("archive_entities", e))?;

        Span::current().record("archived", result.rows_affected());
        Ok(result.rows_affected())
    }

    async fn history_for_sync(&mut self, sync_id: SyncId) -> TrackerResult<Vec<EntityHistory>> {
        let rows = sqlx::query(
            r#"
            SELECT entity_id, file_id, sync_id, base_sync_id, changeset_id, status, action, fail_reason
            FROM entity_history
            WHERE sync_id = $1
            ORDER BY file_id, entity_id
            "#,
        )
        .bind(sync_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("history_for_sync", e))?;

        rows.iter().map(history_from_row).collect()
    }
}

// Row decoding. Status columns are TEXT and parsed into the domain enums.

fn column<'r, T>(row: &'r PgRow, name: &str) -> TrackerResult<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| TrackerError::storage(format!("failed to read column {name}: {e}")))
}

fn text_column<T>(row: &PgRow, name: &str) -> TrackerResult<T>
where
    T: std::str::FromStr<Err = TrackerError>,
{
    let text: String = column(row, name)?;
    text.parse()
        .map_err(|e| TrackerError::storage(format!("bad value in column {name}: {e}")))
}

fn sync_from_row(row: &PgRow) -> TrackerResult<SyncRun> {
    Ok(SyncRun {
        id: SyncId::from_uuid(column(row, "id")?),
        layer_id: column(row, "layer_id")?,
        geometry_type: text_column(row, "geometry_type")?,
        dump_date: column::<DateTime<Utc>>(row, "dump_date")?,
        start_date: column::<DateTime<Utc>>(row, "start_date")?,
        end_date: column(row, "end_date")?,
        status: text_column(row, "status")?,
        total_files: column(row, "total_files")?,
        is_full: column(row, "is_full")?,
        base_sync_id: column::<Option<Uuid>>(row, "base_sync_id")?.map(SyncId::from_uuid),
        run_number: column(row, "run_number")?,
        metadata: column(row, "metadata")?,
    })
}

fn file_from_row(row: &PgRow) -> TrackerResult<File> {
    Ok(File {
        file_id: FileId::from_uuid(column(row, "file_id")?),
        sync_id: SyncId::from_uuid(column(row, "sync_id")?),
        status: text_column(row, "status")?,
        total_entities: column(row, "total_entities")?,
        start_date: column(row, "start_date")?,
        end_date: column(row, "end_date")?,
    })
}

fn entity_from_row(row: &PgRow) -> TrackerResult<Entity> {
    Ok(Entity {
        entity_id: EntityId::new(column::<String>(row, "entity_id")?),
        file_id: FileId::from_uuid(column(row, "file_id")?),
        changeset_id: column::<Option<Uuid>>(row, "changeset_id")?.map(ChangesetId::from_uuid),
        status: text_column::<EntityStatus>(row, "status")?,
        action: text_column(row, "action")?,
        fail_reason: column(row, "fail_reason")?,
    })
}

fn history_from_row(row: &PgRow) -> TrackerResult<EntityHistory> {
    Ok(EntityHistory {
        entity_id: EntityId::new(column::<String>(row, "entity_id")?),
        file_id: FileId::from_uuid(column(row, "file_id")?),
        sync_id: SyncId::from_uuid(column(row, "sync_id")?),
        base_sync_id: column::<Option<Uuid>>(row, "base_sync_id")?.map(SyncId::from_uuid),
        changeset_id: column::<Option<Uuid>>(row, "changeset_id")?.map(ChangesetId::from_uuid),
        status: text_column(row, "status")?,
        action: text_column(row, "action")?,
        fail_reason: column(row, "fail_reason")?,
    })
}

/// Map SQLx errors to the tracker taxonomy.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> TrackerError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("40001") | Some("40P01") => TrackerError::TransactionFailure(msg),
                Some("23505") => TrackerError::AlreadyExists(msg),
                Some("23503") => TrackerError::NotFound(msg),
                _ => TrackerError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            TrackerError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => TrackerError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
