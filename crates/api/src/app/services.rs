//! Infrastructure wiring: storage, broker, closure engine, reruns and workers.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use synctrack_core::{SyncId, TrackerResult};
use synctrack_infra::jobs::{
    Broker, InMemoryBroker, JobHandler, JobQueue, Lane, LaneCounts, Worker, WorkerHandle,
};
use synctrack_infra::store::{InMemoryDatabase, PgDatabase, TransactionSource};
use synctrack_infra::{
    ClosureEngine, RerunOutcome, RerunParams, RerunService, TransactionManager, WorkerConfig,
};
use synctrack_observability::MetricsRegistry;

use crate::settings::Settings;

/// Closure engine and rerun service over one storage backend.
pub struct Pipeline<S> {
    pub database: S,
    pub closure: ClosureEngine<S>,
    pub reruns: RerunService<S>,
}

impl<S: TransactionSource + Clone> Pipeline<S> {
    fn new(database: S, settings: &Settings, queue: JobQueue) -> Self {
        let transactions = Arc::new(TransactionManager::new(
            database.clone(),
            settings.transaction_config(),
        ));
        Self {
            closure: ClosureEngine::new(transactions.clone(), queue),
            reruns: RerunService::new(transactions),
            database,
        }
    }

    fn handler(&self) -> Arc<dyn JobHandler> {
        Arc::new(self.closure.clone())
    }
}

pub enum Backend {
    InMemory(Pipeline<InMemoryDatabase>),
    Postgres(Pipeline<PgDatabase>),
}

pub struct AppServices {
    backend: Backend,
    queue: JobQueue,
    metrics: Arc<MetricsRegistry>,
    worker_config: WorkerConfig,
}

/// Connect storage and broker as configured.
pub async fn build_services(settings: &Settings) -> anyhow::Result<AppServices> {
    let metrics = MetricsRegistry::arc();
    let broker = build_broker(settings).await?;
    let queue = JobQueue::new(broker, settings.queue_config(), metrics.clone());

    let backend = match &settings.database_url {
        Some(url) => {
            let database = PgDatabase::connect(url, settings.database_max_connections)
                .await
                .context("failed to connect to Postgres")?;
            if settings.database_migrate {
                database.migrate().await.context("failed to apply schema")?;
            }
            info!(max_connections = settings.database_max_connections, "using Postgres storage");
            Backend::Postgres(Pipeline::new(database, settings, queue.clone()))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory storage");
            Backend::InMemory(Pipeline::new(InMemoryDatabase::new(), settings, queue.clone()))
        }
    };

    Ok(AppServices {
        backend,
        queue,
        metrics,
        worker_config: settings.worker_config(),
    })
}

#[cfg(feature = "redis")]
async fn build_broker(settings: &Settings) -> anyhow::Result<Arc<dyn Broker>> {
    match &settings.redis_url {
        Some(url) => {
            let broker = synctrack_infra::jobs::RedisBroker::connect(url, settings.queue_prefix.clone())
                .await
                .context("failed to connect to Redis")?;
            info!(prefix = %settings.queue_prefix, "using Redis broker");
            Ok(Arc::new(broker))
        }
        None => {
            warn!("REDIS_URL not set; using in-memory broker");
            Ok(InMemoryBroker::arc())
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn build_broker(settings: &Settings) -> anyhow::Result<Arc<dyn Broker>> {
    if settings.redis_url.is_some() {
        warn!("REDIS_URL ignored: built without the `redis` feature");
    }
    Ok(InMemoryBroker::arc())
}

impl AppServices {
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// The in-memory store, when running without Postgres.
    pub fn in_memory_database(&self) -> Option<&InMemoryDatabase> {
        match &self.backend {
            Backend::InMemory(pipeline) => Some(&pipeline.database),
            Backend::Postgres(_) => None,
        }
    }

    pub async fn create_rerun(
        &self,
        base_sync_id: SyncId,
        params: RerunParams,
    ) -> TrackerResult<RerunOutcome> {
        match &self.backend {
            Backend::InMemory(pipeline) => pipeline.reruns.create_rerun(base_sync_id, params).await,
            Backend::Postgres(pipeline) => pipeline.reruns.create_rerun(base_sync_id, params).await,
        }
    }

    pub async fn ping(&self) -> TrackerResult<()> {
        match &self.backend {
            Backend::InMemory(_) => Ok(()),
            Backend::Postgres(pipeline) => pipeline.database.ping().await,
        }
    }

    pub async fn lane_counts(&self) -> TrackerResult<Vec<(Lane, LaneCounts)>> {
        let mut counts = Vec::with_capacity(Lane::ALL.len());
        for lane in Lane::ALL {
            counts.push((lane, self.queue.broker().counts(lane).await?));
        }
        Ok(counts)
    }

    /// Start one worker per lane.
    pub fn spawn_workers(&self) -> Vec<WorkerHandle> {
        let handler = match &self.backend {
            Backend::InMemory(pipeline) => pipeline.handler(),
            Backend::Postgres(pipeline) => pipeline.handler(),
        };
        Lane::ALL
            .into_iter()
            .map(|lane| {
                Worker::new(
                    lane,
                    self.queue.broker().clone(),
                    handler.clone(),
                    self.worker_config.clone(),
                    self.metrics.lane(lane.name()),
                )
                .spawn()
            })
            .collect()
    }

    /// Stop workers, then release the connection pool.
    pub async fn shutdown(&self, workers: Vec<WorkerHandle>) {
        for worker in workers {
            worker.shutdown().await;
        }
        if let Backend::Postgres(pipeline) = &self.backend {
            pipeline.database.close().await;
        }
        info!("services stopped");
    }
}
