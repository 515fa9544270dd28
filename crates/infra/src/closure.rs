//! The closure cascade: changeset → file → sync.
//!
//! Each step runs its predicate inside one retried transaction and, on
//! success, publishes the next step's job. Predicates are compare-and-set
//! statements, so a step re-delivered after its target already closed finds
//! nothing to do and publishes nothing.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, instrument};

use synctrack_core::{ChangesetId, FileId, FileStatus, SyncId, TrackerError, TrackerResult};

use crate::jobs::{JobHandler, JobKind, JobPayload, JobQueue};
use crate::store::{EntityStore, FileStore, SyncStore, TransactionSource};
use crate::transaction::{TransactionManager, TxContext};

/// Result of closing a set of changesets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangesetClosure {
    /// Candidate files a closure job was published for.
    pub invoked_files: usize,
    pub file_ids: Vec<FileId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileClosure {
    pub file_id: FileId,
    pub closed: bool,
    /// Owning sync, set when the file closed.
    pub sync_id: Option<SyncId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncClosure {
    pub sync_id: SyncId,
    /// The sync and, if it closed too, its latest rerun.
    pub closed: Vec<SyncId>,
}

pub struct ClosureEngine<S> {
    transactions: Arc<TransactionManager<S>>,
    queue: JobQueue,
}

impl<S> Clone for ClosureEngine<S> {
    fn clone(&self) -> Self {
        Self {
            transactions: Arc::clone(&self.transactions),
            queue: self.queue.clone(),
        }
    }
}

impl<S: TransactionSource> ClosureEngine<S> {
    pub fn new(transactions: Arc<TransactionManager<S>>, queue: JobQueue) -> Self {
        Self {
            transactions,
            queue,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Mark every entity of `changeset_ids` completed and publish a file
    /// closure job for each in-progress file they touch.
    #[instrument(skip(self, changeset_ids), fields(changesets = changeset_ids.len()), err)]
    pub async fn close_changesets(
        &self,
        changeset_ids: &[ChangesetId],
        correlation_id: &str,
    ) -> TrackerResult<ChangesetClosure> {
        let ids = changeset_ids.to_vec();
        let file_ids = self
            .transactions
            .run(
                TxContext::new("close_changesets", correlation_id),
                move |uow| {
                    let ids = ids.clone();
                    Box::pin(async move {
                        let updated = uow.mark_changeset_entities_completed(&ids).await?;
                        debug!(updated, "changeset entities completed");
                        uow.find_files_for_changesets(&ids, &[FileStatus::InProgress])
                            .await
                    })
                },
            )
            .await?;

        if !file_ids.is_empty() {
            let targets: Vec<String> = file_ids.iter().map(ToString::to_string).collect();
            self.queue.push(JobKind::FileClosure, &targets).await?;
        }

        Ok(ChangesetClosure {
            invoked_files: file_ids.len(),
            file_ids,
        })
    }

    /// Close `file_id` if all of its entities are resolved; on closure
    /// publish one sync closure job for the owning sync.
    #[instrument(skip(self), err)]
    pub async fn close_file(&self, file_id: FileId, correlation_id: &str) -> TrackerResult<FileClosure> {
        let sync_id = self
            .transactions
            .run(TxContext::new("close_file", correlation_id), move |uow| {
                Box::pin(async move { uow.try_close_file(file_id).await })
            })
            .await?;

        if let Some(sync_id) = sync_id {
            info!(%file_id, %sync_id, "file closed");
            self.queue
                .push(JobKind::SyncClosure, &[sync_id.to_string()])
                .await?;
        }

        Ok(FileClosure {
            file_id,
            closed: sync_id.is_some(),
            sync_id,
        })
    }

    /// Close `sync_id` (and its latest in-progress rerun) if every declared
    /// file completed.
    #[instrument(skip(self), err)]
    pub async fn close_sync(&self, sync_id: SyncId, correlation_id: &str) -> TrackerResult<SyncClosure> {
        let closed = self
            .transactions
            .run(TxContext::new("close_sync", correlation_id), move |uow| {
                Box::pin(async move { uow.try_close_sync(sync_id).await })
            })
            .await?;

        if !closed.is_empty() {
            info!(%sync_id, closed = ?closed, "sync closed");
        }
        Ok(SyncClosure { sync_id, closed })
    }
}

#[async_trait]
impl<S: TransactionSource> JobHandler for ClosureEngine<S> {
    async fn handle(&self, job: &JobPayload) -> TrackerResult<serde_json::Value> {
        let value = match job.kind {
            JobKind::ChangesetClosure => {
                let ids = parse_ids::<ChangesetId>(job)?;
                serde_json::to_value(self.close_changesets(&ids, &job.id).await?)?
            }
            JobKind::FileClosure => {
                let mut results = Vec::new();
                for file_id in parse_ids::<FileId>(job)? {
                    results.push(self.close_file(file_id, &job.id).await?);
                }
                single_or_all(results)?
            }
            JobKind::SyncClosure => {
                let mut results = Vec::new();
                for sync_id in parse_ids::<SyncId>(job)? {
                    results.push(self.close_sync(sync_id, &job.id).await?);
                }
                single_or_all(results)?
            }
        };
        Ok(value)
    }
}

fn parse_ids<T>(job: &JobPayload) -> TrackerResult<Vec<T>>
where
    T: std::str::FromStr<Err = TrackerError>,
{
    job.member_ids().into_iter().map(str::parse).collect()
}

fn single_or_all<T: Serialize>(mut results: Vec<T>) -> TrackerResult<serde_json::Value> {
    Ok(if results.len() == 1 {
        serde_json::to_value(results.remove(0))?
    } else {
        serde_json::to_value(results)?
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use synctrack_core::{
        Changeset, EntityId, EntityPatch, EntityStatus, ErrorKind, SyncStatus,
    };
    use synctrack_observability::MetricsRegistry;

    use crate::config::{QueueConfig, TransactionConfig, TransactionRetryConfig, WorkerConfig};
    use crate::jobs::{Broker, FailDisposition, InMemoryBroker, JobOutcome, Lane, Worker};
    use crate::store::{ChangesetStore, InMemoryDatabase, UnitOfWork};
    use crate::testing::{entity_in_changeset, entity_row, file_row, sync_row};
    use crate::transaction::IsolationLevel;

    struct Fixture {
        db: InMemoryDatabase,
        broker: Arc<InMemoryBroker>,
        engine: ClosureEngine<InMemoryDatabase>,
        metrics: Arc<MetricsRegistry>,
    }

    fn fixture() -> Fixture {
        fixture_with(TransactionConfig::default())
    }

    fn fixture_with(config: TransactionConfig) -> Fixture {
        let db = InMemoryDatabase::new();
        let broker = InMemoryBroker::arc();
        let metrics = MetricsRegistry::arc();
        let queue = JobQueue::new(broker.clone(), QueueConfig::default(), metrics.clone());
        let transactions = Arc::new(TransactionManager::new(db.clone(), config));
        Fixture {
            engine: ClosureEngine::new(transactions, queue),
            db,
            broker,
            metrics,
        }
    }

    /// Sync S (1 file) → file F (2 entities) → E1 in changeset C, E2 open.
    struct Scenario {
        sync_id: SyncId,
        file_id: FileId,
        changeset_id: ChangesetId,
    }

    async fn seed(db: &InMemoryDatabase) -> Scenario {
        let sync = sync_row(1);
        let file = file_row(sync.id, Some(2));
        let changeset = Changeset {
            changeset_id: ChangesetId::new(),
            osm_id: None,
        };

        let mut uow = db.begin(IsolationLevel::Serializable).await.unwrap();
        uow.insert_sync(&sync).await.unwrap();
        uow.insert_file(&file).await.unwrap();
        uow.insert_changeset(&changeset).await.unwrap();
        uow.insert_entities(&[
            entity_in_changeset("E1", file.file_id, changeset.changeset_id),
            entity_row("E2", file.file_id, EntityStatus::InProgress),
        ])
        .await
        .unwrap();
        uow.commit().await.unwrap();

        Scenario {
            sync_id: sync.id,
            file_id: file.file_id,
            changeset_id: changeset.changeset_id,
        }
    }

    async fn patch(db: &InMemoryDatabase, id: &str, file_id: FileId, status: EntityStatus) {
        let mut uow = db.begin(IsolationLevel::Serializable).await.unwrap();
        uow.patch_entity(&EntityId::new(id), file_id, &EntityPatch::status(status))
            .await
            .unwrap();
        uow.commit().await.unwrap();
    }

    fn worker(f: &Fixture, lane: Lane) -> Worker {
        Worker::new(
            lane,
            f.broker.clone(),
            Arc::new(f.engine.clone()),
            WorkerConfig::default(),
            f.metrics.lane(lane.name()),
        )
    }

    #[tokio::test]
    async fn cascade_closes_file_then_sync() {
        let f = fixture();
        let s = seed(&f.db).await;

        let changesets = f
            .engine
            .close_changesets(&[s.changeset_id], "t")
            .await
            .unwrap();
        assert_eq!(changesets.file_ids, vec![s.file_id]);
        assert_eq!(f.broker.pending_jobs(Lane::Files).len(), 1);

        let file = f.engine.close_file(s.file_id, "t").await.unwrap();
        assert!(!file.closed);
        assert!(f.broker.pending_jobs(Lane::Syncs).is_empty());

        patch(&f.db, "E2", s.file_id, EntityStatus::NotSynced).await;

        let file = f.engine.close_file(s.file_id, "t").await.unwrap();
        assert_eq!(file.sync_id, Some(s.sync_id));
        let sync_jobs = f.broker.pending_jobs(Lane::Syncs);
        assert_eq!(sync_jobs.len(), 1);
        assert_eq!(sync_jobs[0].id, s.sync_id.to_string());

        let sync = f.engine.close_sync(s.sync_id, "t").await.unwrap();
        assert_eq!(sync.closed, vec![s.sync_id]);

        let row = f.db.sync_row(s.sync_id).await.unwrap();
        assert_eq!(row.status, SyncStatus::Completed);
        assert!(row.end_date.is_some());
    }

    #[tokio::test]
    async fn workers_drive_the_cascade_through_the_lanes() {
        let f = fixture();
        let s = seed(&f.db).await;
        patch(&f.db, "E2", s.file_id, EntityStatus::NotSynced).await;

        f.engine
            .queue()
            .push(JobKind::ChangesetClosure, &[s.changeset_id.to_string()])
            .await
            .unwrap();

        for lane in Lane::ALL {
            let outcome = worker(&f, lane).process_next().await.unwrap();
            assert!(
                matches!(outcome, JobOutcome::Completed { .. }),
                "{lane}: {outcome:?}"
            );
        }

        assert_eq!(
            f.db.sync_row(s.sync_id).await.unwrap().status,
            SyncStatus::Completed
        );
        assert_eq!(f.metrics.lane("syncs").snapshot().completed, 1);
    }

    #[tokio::test]
    async fn repeated_closure_is_a_no_op() {
        let f = fixture();
        let s = seed(&f.db).await;
        patch(&f.db, "E2", s.file_id, EntityStatus::NotSynced).await;
        f.engine.close_changesets(&[s.changeset_id], "t").await.unwrap();
        f.engine.close_file(s.file_id, "t").await.unwrap();
        f.engine.close_sync(s.sync_id, "t").await.unwrap();
        let closed = f.db.sync_row(s.sync_id).await.unwrap();
        let file_closed = f.db.file_row(s.file_id).await.unwrap();

        let again = f.engine.close_file(s.file_id, "t").await.unwrap();
        assert!(!again.closed);
        assert!(f.engine.close_sync(s.sync_id, "t").await.unwrap().closed.is_empty());

        assert_eq!(f.db.sync_row(s.sync_id).await.unwrap(), closed);
        assert_eq!(f.db.file_row(s.file_id).await.unwrap(), file_closed);
        // Only the first closure published a sync job.
        assert_eq!(f.broker.pending_jobs(Lane::Syncs).len(), 1);
    }

    #[tokio::test]
    async fn out_of_order_deliveries_close_the_sync_exactly_once() {
        let f = fixture();
        let sync = sync_row(2);
        let files = [file_row(sync.id, Some(1)), file_row(sync.id, Some(1))];
        let mut uow = f.db.begin(IsolationLevel::Serializable).await.unwrap();
        uow.insert_sync(&sync).await.unwrap();
        for (n, file) in files.iter().enumerate() {
            uow.insert_file(file).await.unwrap();
            uow.insert_entities(&[entity_row(
                &format!("E{n}"),
                file.file_id,
                EntityStatus::Completed,
            )])
            .await
            .unwrap();
        }
        uow.commit().await.unwrap();

        // Sync closure arrives before any file closed, then files in reverse,
        // then everything once more.
        assert!(f.engine.close_sync(sync.id, "t").await.unwrap().closed.is_empty());
        f.engine.close_file(files[1].file_id, "t").await.unwrap();
        assert!(f.engine.close_sync(sync.id, "t").await.unwrap().closed.is_empty());
        f.engine.close_file(files[0].file_id, "t").await.unwrap();

        let first = f.engine.close_sync(sync.id, "t").await.unwrap();
        let end_date = f.db.sync_row(sync.id).await.unwrap().end_date;
        for file in &files {
            f.engine.close_file(file.file_id, "t").await.unwrap();
        }
        let second = f.engine.close_sync(sync.id, "t").await.unwrap();

        assert_eq!(first.closed, vec![sync.id]);
        assert!(second.closed.is_empty());
        assert!(end_date.is_some());
        assert_eq!(f.db.sync_row(sync.id).await.unwrap().end_date, end_date);
    }

    #[tokio::test]
    async fn no_candidate_files_publishes_nothing() {
        let f = fixture();
        let s = seed(&f.db).await;
        patch(&f.db, "E2", s.file_id, EntityStatus::NotSynced).await;
        f.engine.close_changesets(&[s.changeset_id], "t").await.unwrap();
        f.engine.close_file(s.file_id, "t").await.unwrap();
        let before = f.broker.counts(Lane::Files).await.unwrap();

        // The file is no longer in progress, so it is not a candidate.
        let result = f.engine.close_changesets(&[s.changeset_id], "t").await.unwrap();

        assert_eq!(result.invoked_files, 0);
        assert_eq!(f.broker.counts(Lane::Files).await.unwrap(), before);
    }

    #[tokio::test]
    async fn exhausted_retry_budget_surfaces_from_the_engine() {
        let f = fixture();
        let s = seed(&f.db).await;
        f.db.fail_next_commits(4);

        let err = f.engine.close_file(s.file_id, "t").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ExceededNumberOfRetries);
    }

    #[tokio::test(start_paused = true)]
    async fn transaction_failure_in_handler_requeues_without_an_attempt() {
        let f = fixture_with(TransactionConfig {
            retry: TransactionRetryConfig::disabled(),
            ..Default::default()
        });
        let s = seed(&f.db).await;
        f.engine
            .queue()
            .push(JobKind::FileClosure, &[s.file_id.to_string()])
            .await
            .unwrap();
        f.db.fail_next_commits(1);

        let outcome = worker(&f, Lane::Files).process_next().await.unwrap();

        assert!(
            matches!(
                outcome,
                JobOutcome::TransactionFailed {
                    disposition: FailDisposition::Retrying { .. },
                    ..
                }
            ),
            "{outcome:?}"
        );
        let requeued = f.broker.pending_job(Lane::Files, &s.file_id.to_string()).unwrap();
        assert_eq!(requeued.transaction_failures, 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        let outcome = worker(&f, Lane::Files).process_next().await.unwrap();
        assert!(matches!(outcome, JobOutcome::Completed { .. }), "{outcome:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_in_handler_spends_an_attempt() {
        let f = fixture();
        let s = seed(&f.db).await;
        f.engine
            .queue()
            .push(JobKind::FileClosure, &[s.file_id.to_string()])
            .await
            .unwrap();
        f.db.fail_next_commits(4);

        let outcome = worker(&f, Lane::Files).process_next().await.unwrap();

        let JobOutcome::Failed { error, disposition, .. } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(error.kind(), ErrorKind::ExceededNumberOfRetries);
        assert!(matches!(disposition, FailDisposition::Retrying { .. }));
    }

    #[tokio::test]
    async fn malformed_ids_fail_the_job() {
        let f = fixture();
        let job = JobPayload::single(JobKind::SyncClosure, "not-a-uuid");

        let err = f.engine.handle(&job).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidPayload);
    }
}
