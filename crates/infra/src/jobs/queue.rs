//! Publishing jobs onto lanes with batching and deduplication.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use synctrack_core::{TrackerError, TrackerResult};
use synctrack_observability::MetricsRegistry;

use super::store::{AddOutcome, Broker, DeferOutcome};
use super::types::{normalize_ids, JobKind, JobPayload, Lane};
use crate::config::QueueConfig;

// Bounds the add/defer race with consumers claiming the same id.
const MAX_ENQUEUE_ROUNDS: usize = 3;

/// What a push did, per job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Jobs newly queued.
    pub enqueued: Vec<String>,
    /// Jobs coalesced into an already queued job with the same id.
    pub deduplicated: Vec<String>,
}

impl PushReport {
    pub fn job_ids(&self) -> impl Iterator<Item = &str> {
        self.enqueued
            .iter()
            .chain(self.deduplicated.iter())
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.enqueued.len() + self.deduplicated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lane publisher shared by the closure engine and the HTTP surface.
#[derive(Clone)]
pub struct JobQueue {
    broker: Arc<dyn Broker>,
    config: QueueConfig,
    metrics: Arc<MetricsRegistry>,
}

impl JobQueue {
    pub fn new(broker: Arc<dyn Broker>, config: QueueConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            broker,
            config,
            metrics,
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Queue closure jobs for `ids` on the lane of `kind`.
    ///
    /// One id is queued as a job keyed by that id. Several ids are queued one
    /// job per id, or, when the lane is batched, as fixed-size batches of the
    /// sorted distinct ids keyed by their hash.
    #[instrument(skip(self, ids), fields(lane = %kind.lane(), ids = ids.len()), err)]
    pub async fn push<S: AsRef<str>>(&self, kind: JobKind, ids: &[S]) -> TrackerResult<PushReport> {
        let lane = kind.lane();
        let jobs = match (ids, self.config.lane(lane).batch_size) {
            ([], _) => Vec::new(),
            ([only], _) => vec![JobPayload::single(kind, only.as_ref())],
            (_, None) => ids
                .iter()
                .map(|id| JobPayload::single(kind, id.as_ref()))
                .collect(),
            (_, Some(batch_size)) => normalize_ids(ids.iter().map(|id| id.as_ref()))
                .chunks(batch_size.max(1))
                .map(|chunk| JobPayload::batch(kind, chunk.to_vec()))
                .collect(),
        };

        let mut report = PushReport::default();
        for job in jobs {
            if self.enqueue(lane, &job).await? {
                report.enqueued.push(job.id);
            } else {
                report.deduplicated.push(job.id);
            }
        }
        Ok(report)
    }

    /// Returns `true` when a new job was queued, `false` when it was
    /// coalesced into an existing one.
    async fn enqueue(&self, lane: Lane, job: &JobPayload) -> TrackerResult<bool> {
        let options = self.config.lane(lane);

        for _ in 0..MAX_ENQUEUE_ROUNDS {
            if self.broker.add(lane, job, options, Duration::ZERO).await? == AddOutcome::Added {
                return Ok(true);
            }

            match self.broker.defer(lane, &job.id, options.dedup_delay).await? {
                DeferOutcome::Deferred { dedup_count } => {
                    self.metrics.lane(lane.name()).record_duplicate();
                    debug!(lane = %lane, job_id = %job.id, dedup_count, "duplicate job deferred");
                    return Ok(false);
                }
                // Claimed between add and defer; queue it again.
                DeferOutcome::Missing => continue,
            }
        }

        Err(TrackerError::queue(format!(
            "could not enqueue or defer job {} on lane {}",
            job.id, lane
        )))
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LaneOptions;
    use crate::jobs::store::InMemoryBroker;
    use crate::jobs::types::batch_job_id;

    fn queue(config: QueueConfig) -> (JobQueue, Arc<InMemoryBroker>, Arc<MetricsRegistry>) {
        let broker = InMemoryBroker::arc();
        let metrics = MetricsRegistry::arc();
        (
            JobQueue::new(broker.clone(), config, metrics.clone()),
            broker,
            metrics,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn same_id_pushed_three_times_is_one_job() {
        let (queue, broker, metrics) = queue(QueueConfig::default());

        for _ in 0..3 {
            queue.push(JobKind::FileClosure, &["f1"]).await.unwrap();
        }

        let pending = broker.pending_jobs(Lane::Files);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "f1");
        assert_eq!(pending[0].dedup_count, 2);
        assert_eq!(metrics.lane("files").snapshot().duplicates, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unbatched_lane_queues_one_job_per_id() {
        let (queue, broker, _) = queue(QueueConfig::default());

        let report = queue.push(JobKind::FileClosure, &["f2", "f1", "f3"]).await.unwrap();

        assert_eq!(report.enqueued, vec!["f2", "f1", "f3"]);
        assert_eq!(broker.pending_jobs(Lane::Files).len(), 3);
        assert!(broker.pending_job(Lane::Files, "f1").unwrap().batch_ids.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn batched_lane_groups_sorted_ids_under_their_hash() {
        let config = QueueConfig {
            changesets: LaneOptions::batched(2),
            ..Default::default()
        };
        let (queue, broker, _) = queue(config);

        let report = queue
            .push(JobKind::ChangesetClosure, &["c3", "c1", "c2", "c1"])
            .await
            .unwrap();

        let first = batch_job_id(&["c1", "c2"]);
        let second = batch_job_id(&["c3"]);
        assert_eq!(report.enqueued, vec![first.clone(), second]);
        assert_eq!(
            broker.pending_job(Lane::Changesets, &first).unwrap().batch_ids,
            Some(vec!["c1".to_string(), "c2".to_string()])
        );

        // The same set in another order collapses onto the queued batches.
        let again = queue
            .push(JobKind::ChangesetClosure, &["c2", "c3", "c1"])
            .await
            .unwrap();
        assert!(again.enqueued.is_empty());
        assert_eq!(again.deduplicated.len(), 2);
        assert_eq!(broker.pending_jobs(Lane::Changesets).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn push_after_claim_queues_a_fresh_job() {
        let (queue, broker, _) = queue(QueueConfig::default());
        queue.push(JobKind::SyncClosure, &["s1"]).await.unwrap();
        broker
            .claim(Lane::Syncs, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let report = queue.push(JobKind::SyncClosure, &["s1"]).await.unwrap();

        assert_eq!(report.enqueued, vec!["s1"]);
        assert_eq!(broker.counts(Lane::Syncs).await.unwrap().active, 1);
        assert_eq!(broker.pending_jobs(Lane::Syncs).len(), 1);
    }

    #[tokio::test]
    async fn empty_push_is_a_no_op() {
        let (queue, broker, _) = queue(QueueConfig::default());
        let none: [&str; 0] = [];
        assert!(queue.push(JobKind::FileClosure, &none).await.unwrap().is_empty());
        assert!(broker.pending_jobs(Lane::Files).is_empty());
    }
}
