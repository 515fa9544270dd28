//! Closure job lanes, brokers and workers.
//!
//! ## Design
//!
//! - One lane per closure step: changesets, files, syncs
//! - Jobs are keyed by target id (or by batch hash) and deduplicated while pending
//! - Transaction failures are re-queued after a jittered delay without
//!   consuming an attempt; other failures spend the lane's attempt budget
//! - Claimed jobs carry a lease; expired leases are recovered as stalled
//! - Each claim gets a token, and only the current token can settle the job
//!
//! ## Components
//!
//! - [`JobQueue`]: publishing with batching and deduplication
//! - [`Broker`]: lane storage ([`InMemoryBroker`], `RedisBroker` with the `redis` feature)
//! - [`Worker`]: claims, runs and settles jobs for one lane

pub mod executor;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis;
pub mod store;
pub mod types;

pub use executor::{JobHandler, JobOutcome, Worker, WorkerHandle, jittered_delay};
pub use queue::{JobQueue, PushReport};
#[cfg(feature = "redis")]
pub use redis::RedisBroker;
pub use store::{
    AddOutcome, Broker, ClaimedJob, DeferOutcome, FailDisposition, FailedJob, InMemoryBroker,
    LaneCounts, StalledJob,
};
pub use types::{JobKind, JobPayload, Lane, batch_job_id, normalize_ids};
