//! Infrastructure of the sync completion tracker: storage, transactions,
//! job lanes, workers, the closure cascade and reruns.

pub mod closure;
pub mod config;
pub mod jobs;
pub mod rerun;
pub mod store;
pub mod transaction;

#[cfg(test)]
pub(crate) mod testing;

pub use closure::{ChangesetClosure, ClosureEngine, FileClosure, SyncClosure};
pub use config::{
    BackoffWindow, LaneOptions, QueueConfig, TransactionConfig, TransactionRetryConfig,
    WorkerConfig,
};
pub use rerun::{RerunOutcome, RerunParams, RerunService};
pub use transaction::{IsolationLevel, TransactionManager, TxContext, with_retries};
