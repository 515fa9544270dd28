//! Typed configuration for transactions, queue lanes and workers.
//!
//! Loading happens at the process edge; everything here only describes values
//! and their defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::jobs::Lane;
use crate::transaction::IsolationLevel;

/// In-process retry policy for transaction failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionRetryConfig {
    pub enabled: bool,
    /// Retries after the first attempt.
    pub num_retries: u32,
}

impl Default for TransactionRetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            num_retries: 3,
        }
    }
}

impl TransactionRetryConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            num_retries: 0,
        }
    }

    /// Total number of attempts a unit of work gets.
    pub fn max_attempts(&self) -> u32 {
        if self.enabled { self.num_retries + 1 } else { 1 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub isolation_level: IsolationLevel,
    pub retry: TransactionRetryConfig,
}

/// Per-lane publishing and redelivery options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneOptions {
    /// `Some(n)`: multi-job pushes are split into batches of `n`.
    pub batch_size: Option<usize>,
    /// Delay applied to an already-queued job when a duplicate is pushed.
    pub dedup_delay: Duration,
    /// Delivery attempts before a job is failed for good.
    pub attempts: u32,
    /// Redelivery delay after an unclassified failure.
    pub backoff: Duration,
}

impl Default for LaneOptions {
    fn default() -> Self {
        Self {
            batch_size: None,
            dedup_delay: Duration::from_secs(1),
            attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

impl LaneOptions {
    pub fn batched(batch_size: usize) -> Self {
        Self {
            batch_size: Some(batch_size.max(1)),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Key prefix used by durable brokers.
    pub prefix: String,
    pub changesets: LaneOptions,
    pub files: LaneOptions,
    pub syncs: LaneOptions,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            prefix: "synctrack".to_string(),
            changesets: LaneOptions::batched(100),
            files: LaneOptions::default(),
            syncs: LaneOptions::default(),
        }
    }
}

impl QueueConfig {
    pub fn lane(&self, lane: Lane) -> &LaneOptions {
        match lane {
            Lane::Changesets => &self.changesets,
            Lane::Files => &self.files,
            Lane::Syncs => &self.syncs,
        }
    }
}

/// Randomised delay window for re-queueing after a transaction failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffWindow {
    pub min: Duration,
    pub max: Duration,
}

impl Default for BackoffWindow {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(500),
            max: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Concurrent consumers per lane.
    pub concurrency: usize,
    /// Sleep between polls when a lane is empty.
    pub poll_interval: Duration,
    /// Liveness window: a claimed job not acknowledged within it is stalled.
    pub lease: Duration,
    /// How often stalled jobs are looked for.
    pub stalled_interval: Duration,
    pub transaction_failure_delay: BackoffWindow,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_millis(100),
            lease: Duration::from_secs(30),
            stalled_interval: Duration::from_secs(30),
            transaction_failure_delay: BackoffWindow::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_budget_counts_the_first_attempt() {
        assert_eq!(TransactionRetryConfig::default().max_attempts(), 4);
        assert_eq!(TransactionRetryConfig::disabled().max_attempts(), 1);
    }

    #[test]
    fn only_changesets_are_batched_by_default() {
        let config = QueueConfig::default();
        assert_eq!(config.lane(Lane::Changesets).batch_size, Some(100));
        assert_eq!(config.lane(Lane::Files).batch_size, None);
        assert_eq!(config.lane(Lane::Syncs).batch_size, None);
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let config: TransactionConfig =
            serde_json::from_value(serde_json::json!({ "retry": { "num_retries": 7 } })).unwrap();
        assert_eq!(config.isolation_level, IsolationLevel::Serializable);
        assert!(config.retry.enabled);
        assert_eq!(config.retry.num_retries, 7);
    }
}
