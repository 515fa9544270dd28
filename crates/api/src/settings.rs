//! Process settings: command-line flags, each backed by an environment variable.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use synctrack_infra::{
    BackoffWindow, IsolationLevel, LaneOptions, QueueConfig, TransactionConfig,
    TransactionRetryConfig, WorkerConfig,
};

#[derive(Parser, Debug, Clone)]
#[command(name = "synctrack-api")]
#[command(about = "Sync completion tracker: closure cascade workers and HTTP triggers", long_about = None)]
pub struct Settings {
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: SocketAddr,

    /// Postgres connection string. Without it an in-memory store is used.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 10)]
    pub database_max_connections: u32,

    /// Apply the bundled schema on startup.
    #[arg(long, env = "DATABASE_MIGRATE", default_value_t = false)]
    pub database_migrate: bool,

    /// Redis connection string. Without it an in-memory broker is used.
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    #[arg(long, env = "QUEUE_PREFIX", default_value = "synctrack")]
    pub queue_prefix: String,

    #[arg(long, env = "ISOLATION_LEVEL", default_value = "serializable")]
    pub isolation_level: IsolationLevel,

    #[arg(long, env = "TRANSACTION_RETRY_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    pub transaction_retry_enabled: bool,

    #[arg(long, env = "TRANSACTION_NUM_RETRIES", default_value_t = 3)]
    pub transaction_num_retries: u32,

    #[arg(long, env = "CHANGESET_BATCH_SIZE", default_value_t = 100)]
    pub changeset_batch_size: usize,

    #[arg(long, env = "QUEUE_DEDUP_DELAY_MS", default_value_t = 1000)]
    pub dedup_delay_ms: u64,

    #[arg(long, env = "QUEUE_ATTEMPTS", default_value_t = 3)]
    pub attempts: u32,

    #[arg(long, env = "QUEUE_BACKOFF_MS", default_value_t = 1000)]
    pub backoff_ms: u64,

    #[arg(long, env = "WORKER_CONCURRENCY", default_value_t = 1)]
    pub worker_concurrency: usize,

    #[arg(long, env = "WORKER_POLL_INTERVAL_MS", default_value_t = 100)]
    pub poll_interval_ms: u64,

    #[arg(long, env = "WORKER_LEASE_MS", default_value_t = 30_000)]
    pub lease_ms: u64,

    #[arg(long, env = "WORKER_STALLED_INTERVAL_MS", default_value_t = 30_000)]
    pub stalled_interval_ms: u64,

    #[arg(long, env = "TRANSACTION_FAILURE_DELAY_MIN_MS", default_value_t = 500)]
    pub transaction_failure_delay_min_ms: u64,

    #[arg(long, env = "TRANSACTION_FAILURE_DELAY_MAX_MS", default_value_t = 5000)]
    pub transaction_failure_delay_max_ms: u64,
}

impl Settings {
    /// Defaults only, ignoring the command line. Environment variables still apply.
    pub fn defaults() -> Self {
        Self::parse_from(["synctrack-api"])
    }

    pub fn transaction_config(&self) -> TransactionConfig {
        TransactionConfig {
            isolation_level: self.isolation_level,
            retry: TransactionRetryConfig {
                enabled: self.transaction_retry_enabled,
                num_retries: self.transaction_num_retries,
            },
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        let lane = LaneOptions {
            batch_size: None,
            dedup_delay: Duration::from_millis(self.dedup_delay_ms),
            attempts: self.attempts,
            backoff: Duration::from_millis(self.backoff_ms),
        };
        QueueConfig {
            prefix: self.queue_prefix.clone(),
            changesets: LaneOptions {
                batch_size: Some(self.changeset_batch_size.max(1)),
                ..lane.clone()
            },
            files: lane.clone(),
            syncs: lane,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        let min = Duration::from_millis(self.transaction_failure_delay_min_ms);
        let max = Duration::from_millis(self.transaction_failure_delay_max_ms);
        WorkerConfig {
            concurrency: self.worker_concurrency.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            lease: Duration::from_millis(self.lease_ms),
            stalled_interval: Duration::from_millis(self.stalled_interval_ms),
            transaction_failure_delay: BackoffWindow {
                min: min.min(max),
                max: max.max(min),
            },
        }
    }
}
