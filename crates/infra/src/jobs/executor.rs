//! Lane workers.
//!
//! A [`Worker`] claims jobs from one lane, runs them through a
//! [`JobHandler`] and settles each one with the broker. Every processing step
//! returns an explicit [`JobOutcome`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use synctrack_core::{ErrorKind, TrackerError, TrackerResult};
use synctrack_observability::LaneMetrics;

use super::store::{Broker, FailDisposition, StalledJob};
use super::types::{JobPayload, Lane};
use crate::config::{BackoffWindow, WorkerConfig};

/// Processes one job payload.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobPayload) -> TrackerResult<serde_json::Value>;
}

/// Result of one [`Worker::process_next`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Nothing ready on the lane.
    Idle,
    Completed {
        job_id: String,
        result: serde_json::Value,
        duration: Duration,
    },
    /// The handler succeeded after the lease ran out and the job was
    /// redelivered; the result was not acknowledged.
    LeaseLost {
        job_id: String,
        duration: Duration,
    },
    /// Re-queued after a jittered delay without consuming an attempt.
    TransactionFailed {
        job_id: String,
        delay: Duration,
        disposition: FailDisposition,
    },
    Failed {
        job_id: String,
        error: TrackerError,
        disposition: FailDisposition,
    },
}

#[derive(Clone)]
pub struct Worker {
    lane: Lane,
    broker: Arc<dyn Broker>,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    metrics: Arc<LaneMetrics>,
}

impl Worker {
    pub fn new(
        lane: Lane,
        broker: Arc<dyn Broker>,
        handler: Arc<dyn JobHandler>,
        config: WorkerConfig,
        metrics: Arc<LaneMetrics>,
    ) -> Self {
        Self {
            lane,
            broker,
            handler,
            config,
            metrics,
        }
    }

    pub fn lane(&self) -> Lane {
        self.lane
    }

    /// Claim and run at most one job.
    pub async fn process_next(&self) -> TrackerResult<JobOutcome> {
        let Some(claimed) = self.broker.claim(self.lane, self.config.lease).await? else {
            return Ok(JobOutcome::Idle);
        };
        let mut payload = claimed.payload;
        debug!(
            lane = %self.lane,
            job_id = %payload.id,
            attempts_made = claimed.attempts_made,
            "claimed job"
        );

        let started = Instant::now();
        let result = self.handler.handle(&payload).await;
        let duration = started.elapsed();

        match result {
            Ok(result) => {
                if !self
                    .broker
                    .complete(self.lane, &payload.id, claimed.token)
                    .await?
                {
                    warn!(
                        lane = %self.lane,
                        job_id = %payload.id,
                        duration_ms = duration.as_millis() as u64,
                        "lease lost before completion"
                    );
                    return Ok(JobOutcome::LeaseLost {
                        job_id: payload.id,
                        duration,
                    });
                }
                self.metrics.record_completed(duration);
                debug!(
                    lane = %self.lane,
                    job_id = %payload.id,
                    duration_ms = duration.as_millis() as u64,
                    "job completed"
                );
                Ok(JobOutcome::Completed {
                    job_id: payload.id,
                    result,
                    duration,
                })
            }
            Err(err) if err.kind() == ErrorKind::TransactionFailure => {
                payload.transaction_failures += 1;
                let delay = jittered_delay(self.config.transaction_failure_delay);
                let disposition = self
                    .broker
                    .retry_later(self.lane, &payload, claimed.token, delay)
                    .await?;
                self.metrics.record_transaction_failure(duration);
                self.metrics.record_retry();
                info!(
                    lane = %self.lane,
                    job_id = %payload.id,
                    transaction_failures = payload.transaction_failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transaction failure, job re-queued"
                );
                Ok(JobOutcome::TransactionFailed {
                    job_id: payload.id,
                    delay,
                    disposition,
                })
            }
            Err(err) => {
                let disposition = self
                    .broker
                    .fail(self.lane, &payload.id, claimed.token, &err.to_string())
                    .await?;
                self.metrics.record_failed(duration);
                if matches!(disposition, FailDisposition::Retrying { .. }) {
                    self.metrics.record_retry();
                }
                warn!(
                    lane = %self.lane,
                    job_id = %payload.id,
                    attempts_made = claimed.attempts_made + 1,
                    max_attempts = claimed.max_attempts,
                    transaction_failures = payload.transaction_failures,
                    disposition = ?disposition,
                    error = %err,
                    "job failed"
                );
                Ok(JobOutcome::Failed {
                    job_id: payload.id,
                    error: err,
                    disposition,
                })
            }
        }
    }

    /// Resubmit jobs whose lease expired.
    pub async fn recover_stalled(&self) -> TrackerResult<Vec<StalledJob>> {
        let stalled = self.broker.recover_stalled(self.lane).await?;
        for job in &stalled {
            self.metrics.record_stalled();
            if matches!(job.disposition, FailDisposition::Retrying { .. }) {
                self.metrics.record_retry();
            }
            warn!(
                lane = %self.lane,
                job_id = %job.payload.id,
                stalled = job.payload.stalled,
                disposition = ?job.disposition,
                "job stalled"
            );
        }
        Ok(stalled)
    }

    /// Run `config.concurrency` consumers plus a stalled-job sweeper until
    /// shutdown is requested.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(self.config.concurrency + 1);

        for consumer in 0..self.config.concurrency.max(1) {
            let worker = self.clone();
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                worker.consume(consumer, shutdown).await;
            }));
        }

        let worker = self.clone();
        tasks.push(tokio::spawn(async move {
            worker.sweep_stalled(shutdown_rx).await;
        }));

        info!(lane = %self.lane, concurrency = self.config.concurrency, "worker started");
        WorkerHandle {
            lane: self.lane,
            shutdown: shutdown_tx,
            tasks,
        }
    }

    async fn consume(&self, consumer: usize, mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            let idle = match self.process_next().await {
                Ok(JobOutcome::Idle) => true,
                Ok(_) => false,
                Err(err) => {
                    error!(lane = %self.lane, consumer, error = %err, "failed to process job");
                    true
                }
            };
            if idle && !pause(&mut shutdown, self.config.poll_interval).await {
                break;
            }
        }
        debug!(lane = %self.lane, consumer, "consumer stopped");
    }

    async fn sweep_stalled(&self, mut shutdown: watch::Receiver<bool>) {
        while pause(&mut shutdown, self.config.stalled_interval).await {
            if let Err(err) = self.recover_stalled().await {
                error!(lane = %self.lane, error = %err, "failed to recover stalled jobs");
            }
        }
    }
}

/// Sleep for `period` or until shutdown. Returns whether to keep running.
async fn pause(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => !*shutdown.borrow(),
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("lane", &self.lane)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Handle to stop a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    lane: Lane,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn lane(&self) -> Lane {
        self.lane
    }

    /// Request shutdown and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                error!(lane = %self.lane, error = %err, "worker task panicked");
            }
        }
        info!(lane = %self.lane, "worker stopped");
    }
}

/// Uniformly random delay within `window`.
pub fn jittered_delay(window: BackoffWindow) -> Duration {
    let min = window.min.as_millis() as u64;
    let max = (window.max.as_millis() as u64).max(min);
    Duration::from_millis(rand::thread_rng().gen_range(min..=max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use synctrack_observability::MetricsRegistry;

    use crate::config::LaneOptions;
    use crate::jobs::store::InMemoryBroker;
    use crate::jobs::types::JobKind;

    /// Returns the scripted results in order, then succeeds.
    struct ScriptedHandler {
        script: Mutex<Vec<TrackerResult<serde_json::Value>>>,
        seen: Mutex<Vec<JobPayload>>,
    }

    impl ScriptedHandler {
        fn new(mut script: Vec<TrackerResult<serde_json::Value>>) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                script: Mutex::new(script),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        async fn handle(&self, job: &JobPayload) -> TrackerResult<serde_json::Value> {
            self.seen.lock().unwrap().push(job.clone());
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Ok(serde_json::json!({ "ok": true })))
        }
    }

    async fn worker_with(
        handler: Arc<ScriptedHandler>,
        attempts: u32,
    ) -> (Worker, Arc<InMemoryBroker>, Arc<LaneMetrics>) {
        let broker = InMemoryBroker::arc();
        let options = LaneOptions {
            attempts,
            backoff: Duration::from_secs(1),
            ..Default::default()
        };
        broker
            .add(
                Lane::Files,
                &JobPayload::single(JobKind::FileClosure, "f1"),
                &options,
                Duration::ZERO,
            )
            .await
            .unwrap();
        let metrics = MetricsRegistry::new().lane("files");
        let worker = Worker::new(
            Lane::Files,
            broker.clone(),
            handler,
            WorkerConfig::default(),
            metrics.clone(),
        );
        (worker, broker, metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn successful_job_is_acknowledged() {
        let handler = ScriptedHandler::new(vec![]);
        let (worker, broker, metrics) = worker_with(handler, 3).await;

        let outcome = worker.process_next().await.unwrap();
        assert!(matches!(outcome, JobOutcome::Completed { ref job_id, .. } if job_id == "f1"));
        assert_eq!(worker.process_next().await.unwrap(), JobOutcome::Idle);
        assert_eq!(broker.counts(Lane::Files).await.unwrap().completed, 1);
        assert_eq!(metrics.snapshot().completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transaction_failure_requeues_with_jitter_and_counter() {
        let handler = ScriptedHandler::new(vec![Err(TrackerError::transaction_failure("40001"))]);
        let (worker, _broker, metrics) = worker_with(handler.clone(), 1).await;

        let outcome = worker.process_next().await.unwrap();
        let JobOutcome::TransactionFailed { delay, .. } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        let window = BackoffWindow::default();
        assert!(delay >= window.min && delay <= window.max);

        assert_eq!(worker.process_next().await.unwrap(), JobOutcome::Idle);
        tokio::time::advance(delay).await;

        // One attempt only, yet the job runs again: transaction failures are free.
        let outcome = worker.process_next().await.unwrap();
        assert!(matches!(outcome, JobOutcome::Completed { .. }));
        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen[1].transaction_failures, 1);
        assert_eq!(metrics.snapshot().transaction_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn other_errors_fail_once_attempts_run_out() {
        let handler = ScriptedHandler::new(vec![
            Err(TrackerError::storage("boom")),
            Err(TrackerError::storage("boom")),
        ]);
        let (worker, broker, metrics) = worker_with(handler, 2).await;

        let first = worker.process_next().await.unwrap();
        assert!(matches!(
            first,
            JobOutcome::Failed {
                disposition: FailDisposition::Retrying { .. },
                ..
            }
        ));

        tokio::time::advance(Duration::from_secs(1)).await;
        let second = worker.process_next().await.unwrap();
        assert!(matches!(
            second,
            JobOutcome::Failed {
                disposition: FailDisposition::Failed,
                ..
            }
        ));

        assert_eq!(broker.failed_jobs(Lane::Files).await.unwrap().len(), 1);
        let snap = metrics.snapshot();
        assert_eq!(snap.failed, 2);
        assert_eq!(snap.retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_jobs_are_counted_and_resubmitted() {
        let handler = ScriptedHandler::new(vec![]);
        let (worker, broker, metrics) = worker_with(handler, 3).await;

        broker
            .claim(Lane::Files, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;

        let stalled = worker.recover_stalled().await.unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(metrics.snapshot().stalled, 1);

        let outcome = worker.process_next().await.unwrap();
        assert!(matches!(outcome, JobOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn spawned_worker_drains_the_lane_and_stops() {
        let handler = ScriptedHandler::new(vec![]);
        let (worker, broker, _) = worker_with(handler, 3).await;

        let handle = worker.spawn();
        for _ in 0..100 {
            if broker.counts(Lane::Files).await.unwrap().completed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;

        assert_eq!(broker.counts(Lane::Files).await.unwrap().completed, 1);
    }

    /// Outlives its lease, letting the job be recovered and reclaimed
    /// before returning.
    struct SlowHandler {
        broker: Arc<InMemoryBroker>,
        lease: Duration,
    }

    #[async_trait]
    impl JobHandler for SlowHandler {
        async fn handle(&self, _job: &JobPayload) -> TrackerResult<serde_json::Value> {
            tokio::time::sleep(self.lease).await;
            self.broker.recover_stalled(Lane::Files).await?;
            self.broker.claim(Lane::Files, self.lease).await?;
            Ok(serde_json::json!({ "ok": true }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn late_completion_leaves_the_redelivery_active() {
        let broker = InMemoryBroker::arc();
        broker
            .add(
                Lane::Files,
                &JobPayload::single(JobKind::FileClosure, "f1"),
                &LaneOptions::default(),
                Duration::ZERO,
            )
            .await
            .unwrap();
        let config = WorkerConfig::default();
        let handler = Arc::new(SlowHandler {
            broker: broker.clone(),
            lease: config.lease,
        });
        let metrics = MetricsRegistry::new().lane("files");
        let worker = Worker::new(Lane::Files, broker.clone(), handler, config, metrics.clone());

        let outcome = worker.process_next().await.unwrap();
        assert!(matches!(outcome, JobOutcome::LeaseLost { ref job_id, .. } if job_id == "f1"));

        let counts = broker.counts(Lane::Files).await.unwrap();
        assert_eq!(counts.active, 1);
        assert_eq!(counts.completed, 0);
        assert_eq!(metrics.snapshot().completed, 0);
    }

    #[test]
    fn jitter_stays_inside_the_window() {
        let window = BackoffWindow {
            min: Duration::from_millis(10),
            max: Duration::from_millis(20),
        };
        for _ in 0..100 {
            let delay = jittered_delay(window);
            assert!(delay >= window.min && delay <= window.max);
        }
    }
}
