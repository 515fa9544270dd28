//! Broker abstraction and the in-memory broker.
//!
//! A lane holds pending jobs (waiting or delayed) and active jobs (claimed
//! under a lease), both keyed by job id, plus the history of terminal
//! failures. At most one pending and one active job exist per id; a new
//! pending job may be added while the same id is active, and such a job is
//! not claimed until the active one is settled.
//!
//! Every claim hands out a fresh token. Settling (`complete`, `fail`,
//! `retry_later`) only takes effect while the caller's token still owns the
//! active job, so a worker whose lease expired cannot settle a redelivery
//! another worker now holds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use synctrack_core::TrackerResult;

use super::types::{JobPayload, Lane};
use crate::config::LaneOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// A pending job with the same id is already queued.
    Exists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferOutcome {
    Deferred { dedup_count: u32 },
    /// No pending job with that id anymore.
    Missing,
}

/// What happened to a job after an unclassified failure or a stall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "disposition")]
pub enum FailDisposition {
    /// Attempts remain; redelivered after `delay`.
    Retrying { delay: Duration },
    /// A newer pending job with the same id covers the work.
    Superseded,
    /// Attempts exhausted; moved to the failed set.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub payload: JobPayload,
    /// Identifies this delivery when settling it.
    pub token: u64,
    /// Attempts consumed before this delivery.
    pub attempts_made: u32,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledJob {
    pub payload: JobPayload,
    pub disposition: FailDisposition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedJob {
    pub payload: JobPayload,
    pub attempts_made: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LaneCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Durable (or not) job broker backing the lanes.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Queue `job` after `delay`, unless a pending job with its id exists.
    async fn add(
        &self,
        lane: Lane,
        job: &JobPayload,
        options: &LaneOptions,
        delay: Duration,
    ) -> TrackerResult<AddOutcome>;

    /// Push the pending job `job_id` back by `delay` and count a duplicate.
    async fn defer(&self, lane: Lane, job_id: &str, delay: Duration)
    -> TrackerResult<DeferOutcome>;

    /// Claim the next ready job whose id is not already active.
    async fn claim(&self, lane: Lane, lease: Duration) -> TrackerResult<Option<ClaimedJob>>;

    /// Acknowledge the delivery `token` of an active job. Returns false when
    /// the claim was lost (lease expired, job recovered or reclaimed).
    async fn complete(&self, lane: Lane, job_id: &str, token: u64) -> TrackerResult<bool>;

    /// Record an unclassified failure, consuming one attempt. A lost claim
    /// reports [`FailDisposition::Superseded`].
    async fn fail(
        &self,
        lane: Lane,
        job_id: &str,
        token: u64,
        error: &str,
    ) -> TrackerResult<FailDisposition>;

    /// Re-queue an active job after a transaction failure without consuming
    /// an attempt, storing the updated payload.
    async fn retry_later(
        &self,
        lane: Lane,
        payload: &JobPayload,
        token: u64,
        delay: Duration,
    ) -> TrackerResult<FailDisposition>;

    /// Resubmit active jobs whose lease expired. Each consumes one attempt.
    async fn recover_stalled(&self, lane: Lane) -> TrackerResult<Vec<StalledJob>>;

    async fn counts(&self, lane: Lane) -> TrackerResult<LaneCounts>;

    async fn failed_jobs(&self, lane: Lane) -> TrackerResult<Vec<FailedJob>>;
}

#[derive(Debug, Clone)]
struct QueuedJob {
    payload: JobPayload,
    attempts_made: u32,
    max_attempts: u32,
    backoff: Duration,
    ready_at: Instant,
    seq: u64,
}

#[derive(Debug)]
struct ActiveJob {
    job: QueuedJob,
    token: u64,
    lease_until: Instant,
}

#[derive(Debug, Default)]
struct LaneState {
    pending: HashMap<String, QueuedJob>,
    active: HashMap<String, ActiveJob>,
    failed: Vec<FailedJob>,
    completed: u64,
    seq: u64,
}

impl LaneState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Remove the active job `job_id` if `token` still owns it.
    fn take_active(&mut self, job_id: &str, token: u64) -> Option<ActiveJob> {
        match self.active.get(job_id) {
            Some(active) if active.token == token => self.active.remove(job_id),
            _ => None,
        }
    }

    /// Put a job that left the active set back into pending, unless a newer
    /// pending job with the same id already exists.
    fn requeue(&mut self, mut job: QueuedJob, delay: Duration) -> FailDisposition {
        if self.pending.contains_key(&job.payload.id) {
            return FailDisposition::Superseded;
        }
        job.ready_at = Instant::now() + delay;
        job.seq = self.next_seq();
        self.pending.insert(job.payload.id.clone(), job);
        FailDisposition::Retrying { delay }
    }

    fn consume_attempt(&mut self, mut job: QueuedJob, error: &str, delay: Duration) -> FailDisposition {
        job.attempts_made += 1;
        if job.attempts_made < job.max_attempts {
            return self.requeue(job, delay);
        }
        self.failed.push(FailedJob {
            payload: job.payload,
            attempts_made: job.attempts_made,
            error: error.to_string(),
            failed_at: Utc::now(),
        });
        FailDisposition::Failed
    }
}

/// Process-local broker for tests and single-node runs.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    lanes: Mutex<HashMap<Lane, LaneState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Copy of a pending job, for inspection.
    pub fn pending_job(&self, lane: Lane, job_id: &str) -> Option<JobPayload> {
        let lanes = self.lanes.lock().unwrap();
        lanes
            .get(&lane)
            .and_then(|state| state.pending.get(job_id))
            .map(|job| job.payload.clone())
    }

    /// Every pending job of `lane` in claim order.
    pub fn pending_jobs(&self, lane: Lane) -> Vec<JobPayload> {
        let lanes = self.lanes.lock().unwrap();
        let Some(state) = lanes.get(&lane) else {
            return Vec::new();
        };
        let mut jobs: Vec<&QueuedJob> = state.pending.values().collect();
        jobs.sort_by_key(|job| (job.ready_at, job.seq));
        jobs.into_iter().map(|job| job.payload.clone()).collect()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn add(
        &self,
        lane: Lane,
        job: &JobPayload,
        options: &LaneOptions,
        delay: Duration,
    ) -> TrackerResult<AddOutcome> {
        let mut lanes = self.lanes.lock().unwrap();
        let state = lanes.entry(lane).or_default();
        if state.pending.contains_key(&job.id) {
            return Ok(AddOutcome::Exists);
        }
        let seq = state.next_seq();
        state.pending.insert(
            job.id.clone(),
            QueuedJob {
                payload: job.clone(),
                attempts_made: 0,
                max_attempts: options.attempts.max(1),
                backoff: options.backoff,
                ready_at: Instant::now() + delay,
                seq,
            },
        );
        Ok(AddOutcome::Added)
    }

    async fn defer(
        &self,
        lane: Lane,
        job_id: &str,
        delay: Duration,
    ) -> TrackerResult<DeferOutcome> {
        let mut lanes = self.lanes.lock().unwrap();
        let state = lanes.entry(lane).or_default();
        match state.pending.get_mut(job_id) {
            Some(job) => {
                job.payload.dedup_count += 1;
                job.ready_at = job.ready_at.max(Instant::now() + delay);
                Ok(DeferOutcome::Deferred {
                    dedup_count: job.payload.dedup_count,
                })
            }
            None => Ok(DeferOutcome::Missing),
        }
    }

    async fn claim(&self, lane: Lane, lease: Duration) -> TrackerResult<Option<ClaimedJob>> {
        let mut lanes = self.lanes.lock().unwrap();
        let state = lanes.entry(lane).or_default();
        let now = Instant::now();

        let next = state
            .pending
            .values()
            .filter(|job| job.ready_at <= now && !state.active.contains_key(&job.payload.id))
            .min_by_key(|job| (job.ready_at, job.seq))
            .map(|job| job.payload.id.clone());

        let Some(job_id) = next else {
            return Ok(None);
        };
        let Some(job) = state.pending.remove(&job_id) else {
            return Ok(None);
        };

        let token = state.next_seq();
        let claimed = ClaimedJob {
            payload: job.payload.clone(),
            token,
            attempts_made: job.attempts_made,
            max_attempts: job.max_attempts,
        };
        state.active.insert(
            job_id,
            ActiveJob {
                job,
                token,
                lease_until: now + lease,
            },
        );
        Ok(Some(claimed))
    }

    async fn complete(&self, lane: Lane, job_id: &str, token: u64) -> TrackerResult<bool> {
        let mut lanes = self.lanes.lock().unwrap();
        let state = lanes.entry(lane).or_default();
        if state.take_active(job_id, token).is_none() {
            return Ok(false);
        }
        state.completed += 1;
        Ok(true)
    }

    async fn fail(
        &self,
        lane: Lane,
        job_id: &str,
        token: u64,
        error: &str,
    ) -> TrackerResult<FailDisposition> {
        let mut lanes = self.lanes.lock().unwrap();
        let state = lanes.entry(lane).or_default();
        match state.take_active(job_id, token) {
            Some(active) => {
                let backoff = active.job.backoff;
                Ok(state.consume_attempt(active.job, error, backoff))
            }
            // Lease expired and the job was recovered or reclaimed.
            None => Ok(FailDisposition::Superseded),
        }
    }

    async fn retry_later(
        &self,
        lane: Lane,
        payload: &JobPayload,
        token: u64,
        delay: Duration,
    ) -> TrackerResult<FailDisposition> {
        let mut lanes = self.lanes.lock().unwrap();
        let state = lanes.entry(lane).or_default();
        match state.take_active(&payload.id, token) {
            Some(active) => {
                let mut job = active.job;
                job.payload = payload.clone();
                Ok(state.requeue(job, delay))
            }
            None => Ok(FailDisposition::Superseded),
        }
    }

    async fn recover_stalled(&self, lane: Lane) -> TrackerResult<Vec<StalledJob>> {
        let mut lanes = self.lanes.lock().unwrap();
        let state = lanes.entry(lane).or_default();
        let now = Instant::now();

        let expired: Vec<String> = state
            .active
            .iter()
            .filter(|(_, active)| active.lease_until <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut stalled = Vec::with_capacity(expired.len());
        for job_id in expired {
            let Some(active) = state.active.remove(&job_id) else {
                continue;
            };
            let mut job = active.job;
            job.payload.stalled += 1;
            let payload = job.payload.clone();
            // Resubmitted immediately while attempts remain.
            let disposition = state.consume_attempt(job, "job stalled", Duration::ZERO);
            stalled.push(StalledJob {
                payload,
                disposition,
            });
        }
        Ok(stalled)
    }

    async fn counts(&self, lane: Lane) -> TrackerResult<LaneCounts> {
        let lanes = self.lanes.lock().unwrap();
        let Some(state) = lanes.get(&lane) else {
            return Ok(LaneCounts::default());
        };
        let now = Instant::now();
        let waiting = state.pending.values().filter(|j| j.ready_at <= now).count() as u64;
        Ok(LaneCounts {
            waiting,
            delayed: state.pending.len() as u64 - waiting,
            active: state.active.len() as u64,
            completed: state.completed,
            failed: state.failed.len() as u64,
        })
    }

    async fn failed_jobs(&self, lane: Lane) -> TrackerResult<Vec<FailedJob>> {
        let lanes = self.lanes.lock().unwrap();
        Ok(lanes
            .get(&lane)
            .map(|state| state.failed.clone())
            .unwrap_or_default())
    }
}
