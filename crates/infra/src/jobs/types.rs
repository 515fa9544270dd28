//! Lanes, job payloads and batch identifiers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use synctrack_core::TrackerError;

/// A named queue carrying jobs of one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Changesets,
    Files,
    Syncs,
}

impl Lane {
    pub const ALL: [Lane; 3] = [Lane::Changesets, Lane::Files, Lane::Syncs];

    pub fn name(&self) -> &'static str {
        match self {
            Lane::Changesets => "changesets",
            Lane::Files => "files",
            Lane::Syncs => "syncs",
        }
    }

    /// Kind of every job carried on this lane.
    pub fn job_kind(&self) -> JobKind {
        match self {
            Lane::Changesets => JobKind::ChangesetClosure,
            Lane::Files => JobKind::FileClosure,
            Lane::Syncs => JobKind::SyncClosure,
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Lane {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Lane::ALL
            .into_iter()
            .find(|lane| lane.name() == s)
            .ok_or_else(|| TrackerError::InvalidPayload(format!("unknown lane '{s}'")))
    }
}

/// Job kind for routing to the right closure step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ChangesetClosure,
    FileClosure,
    SyncClosure,
}

impl JobKind {
    pub fn lane(&self) -> Lane {
        match self {
            JobKind::ChangesetClosure => Lane::Changesets,
            JobKind::FileClosure => Lane::Files,
            JobKind::SyncClosure => Lane::Syncs,
        }
    }
}

/// What travels through the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Target id, or the batch hash for batched jobs.
    pub id: String,
    pub kind: JobKind,
    /// Member ids of a batched job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_ids: Option<Vec<String>>,
    /// Times the handler hit a transaction failure and the job was re-queued.
    #[serde(default)]
    pub transaction_failures: u32,
    /// Times the job was claimed but never acknowledged.
    #[serde(default)]
    pub stalled: u32,
    /// Duplicate pushes coalesced into this job.
    #[serde(default)]
    pub dedup_count: u32,
}

impl JobPayload {
    pub fn single(kind: JobKind, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            batch_ids: None,
            transaction_failures: 0,
            stalled: 0,
            dedup_count: 0,
        }
    }

    /// A batch over already deduplicated and sorted ids.
    pub fn batch(kind: JobKind, sorted_ids: Vec<String>) -> Self {
        Self {
            id: batch_job_id(&sorted_ids),
            batch_ids: Some(sorted_ids),
            ..Self::single(kind, String::new())
        }
    }

    /// Ids the handler has to process.
    pub fn member_ids(&self) -> Vec<&str> {
        match &self.batch_ids {
            Some(ids) => ids.iter().map(String::as_str).collect(),
            None => vec![self.id.as_str()],
        }
    }

    pub fn to_json(&self) -> Result<String, TrackerError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, TrackerError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Deterministic id of a batch: SHA-256 over the member ids.
///
/// Callers sort and deduplicate before hashing, so the same id set always
/// maps to the same job regardless of push order or grouping.
pub fn batch_job_id<S: AsRef<str>>(sorted_ids: &[S]) -> String {
    let mut hasher = Sha256::new();
    for id in sorted_ids {
        hasher.update(id.as_ref().as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Sort and deduplicate ids ahead of batching.
pub fn normalize_ids<I, S>(ids: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut ids: Vec<String> = ids.into_iter().map(Into::into).collect();
    ids.sort();
    ids.dedup();
    ids
}
