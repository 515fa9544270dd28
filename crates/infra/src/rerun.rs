//! Reruns: a new attempt chained to a failed root sync.
//!
//! A rerun reopens the unfinished part of its base. The entity state of the
//! previous attempt is archived first, then files and entities are reset, and
//! finally the rerun row is inserted. Everything happens in one transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument};

use synctrack_core::{SyncId, SyncRun, SyncStatus, TrackerError, TrackerResult};

use crate::store::{EntityHistoryStore, EntityStore, FileStore, SyncStore, TransactionSource};
use crate::transaction::{TransactionManager, TxContext};

/// Caller-supplied fields of a new rerun.
#[derive(Debug, Clone, PartialEq)]
pub struct RerunParams {
    pub id: SyncId,
    pub start_date: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

impl RerunParams {
    pub fn new(id: SyncId) -> Self {
        Self {
            id,
            start_date: Utc::now(),
            metadata: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RerunOutcome {
    Created { sync: SyncRun },
    /// Removing empty files let the base close; nothing was reopened.
    NotCreated { closed: Vec<SyncId> },
}

pub struct RerunService<S> {
    transactions: Arc<TransactionManager<S>>,
}

impl<S> Clone for RerunService<S> {
    fn clone(&self) -> Self {
        Self {
            transactions: Arc::clone(&self.transactions),
        }
    }
}

impl<S: TransactionSource> RerunService<S> {
    pub fn new(transactions: Arc<TransactionManager<S>>) -> Self {
        Self { transactions }
    }

    #[instrument(skip(self, params), fields(rerun_id = %params.id), err)]
    pub async fn create_rerun(
        &self,
        base_sync_id: SyncId,
        params: RerunParams,
    ) -> TrackerResult<RerunOutcome> {
        let correlation_id = params.id.to_string();
        let outcome = self
            .transactions
            .run(
                TxContext::new("create_rerun", correlation_id),
                move |uow| {
                    let params = params.clone();
                    Box::pin(async move {
                        let base = uow
                            .find_sync(base_sync_id)
                            .await?
                            .ok_or_else(|| TrackerError::not_found(format!("sync {base_sync_id}")))?;
                        if base.is_rerun() {
                            return Err(TrackerError::conflict(format!(
                                "sync {base_sync_id} is itself a rerun"
                            )));
                        }
                        if base.status != SyncStatus::Failed {
                            return Err(TrackerError::conflict(format!(
                                "sync {base_sync_id} is {}, only failed syncs can be rerun",
                                base.status
                            )));
                        }
                        let latest = uow.latest_rerun(base_sync_id).await?;
                        if let Some(rerun) = latest.as_ref().filter(|r| r.status == SyncStatus::InProgress) {
                            return Err(TrackerError::conflict(format!(
                                "sync {base_sync_id} already has rerun {} in progress",
                                rerun.id
                            )));
                        }
                        if uow.find_sync(params.id).await?.is_some() {
                            return Err(TrackerError::already_exists(format!("sync {}", params.id)));
                        }

                        let deleted = uow.delete_empty_files(base_sync_id).await?;
                        if deleted > 0 {
                            uow.decrement_total_files(base_sync_id, deleted).await?;
                            let closed = uow.try_close_sync(base_sync_id).await?;
                            if !closed.is_empty() {
                                return Ok(RerunOutcome::NotCreated { closed });
                            }
                        }

                        let archived = uow.archive_entities(base_sync_id, params.id).await?;
                        let reopened = uow.reopen_files_with_not_synced(base_sync_id).await?;
                        let reset = uow.reset_entities_for_rerun(base_sync_id).await?;

                        let total_files = if deleted > 0 {
                            uow.find_sync(base_sync_id)
                                .await?
                                .and_then(|s| s.total_files)
                        } else {
                            base.total_files
                        };
                        let rerun = SyncRun {
                            id: params.id,
                            layer_id: base.layer_id,
                            geometry_type: base.geometry_type,
                            dump_date: base.dump_date,
                            start_date: params.start_date,
                            end_date: None,
                            status: SyncStatus::InProgress,
                            total_files,
                            is_full: base.is_full,
                            base_sync_id: Some(base_sync_id),
                            run_number: latest.map_or(0, |r| r.run_number) + 1,
                            metadata: params.metadata,
                        };
                        uow.insert_sync(&rerun).await?;

                        info!(
                            %base_sync_id,
                            rerun_id = %rerun.id,
                            run_number = rerun.run_number,
                            deleted_files = deleted,
                            archived,
                            reopened,
                            reset,
                            "rerun created"
                        );
                        Ok(RerunOutcome::Created { sync: rerun })
                    })
                },
            )
            .await?;

        if let RerunOutcome::NotCreated { closed } = &outcome {
            info!(%base_sync_id, closed = ?closed, "base sync closed, rerun not created");
        }
        Ok(outcome)
    }
}
