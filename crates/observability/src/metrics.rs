//! Per-lane job metrics.
//!
//! Counters are plain atomics shared through `Arc`; a [`MetricsRegistry`] is
//! built once per process and handed to every worker and queue that needs it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

/// Upper bounds (milliseconds) of the processing-duration buckets.
pub const DURATION_BUCKETS_MS: [u64; 9] = [10, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000];

/// Fixed-bucket histogram of processing durations.
#[derive(Debug, Default)]
pub struct DurationHistogram {
    // One slot per bucket plus the overflow bucket.
    buckets: [AtomicU64; DURATION_BUCKETS_MS.len() + 1],
    count: AtomicU64,
    sum_ms: AtomicU64,
}

impl DurationHistogram {
    pub fn observe(&self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        let slot = DURATION_BUCKETS_MS
            .iter()
            .position(|upper| ms <= *upper)
            .unwrap_or(DURATION_BUCKETS_MS.len());
        self.buckets[slot].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: DURATION_BUCKETS_MS
                .iter()
                .map(|upper| Some(*upper))
                .chain(std::iter::once(None))
                .zip(self.buckets.iter())
                .map(|(le_ms, c)| BucketSnapshot {
                    le_ms,
                    count: c.load(Ordering::Relaxed),
                })
                .collect(),
            count: self.count(),
            sum_ms: self.sum_ms.load(Ordering::Relaxed),
        }
    }
}

/// Counters and processing-duration histogram for one queue lane.
#[derive(Debug)]
pub struct LaneMetrics {
    lane: String,
    completed: AtomicU64,
    failed: AtomicU64,
    stalled: AtomicU64,
    transaction_failures: AtomicU64,
    retries: AtomicU64,
    duplicates: AtomicU64,
    processing: DurationHistogram,
}

impl LaneMetrics {
    pub fn new(lane: impl Into<String>) -> Self {
        Self {
            lane: lane.into(),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            stalled: AtomicU64::new(0),
            transaction_failures: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            processing: DurationHistogram::default(),
        }
    }

    pub fn lane(&self) -> &str {
        &self.lane
    }

    pub fn record_completed(&self, duration: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.processing.observe(duration);
    }

    pub fn record_failed(&self, duration: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.processing.observe(duration);
    }

    pub fn record_stalled(&self) {
        self.stalled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transaction_failure(&self, duration: Duration) {
        self.transaction_failures.fetch_add(1, Ordering::Relaxed);
        self.processing.observe(duration);
    }

    /// A job was handed back to the broker for another attempt.
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LaneMetricsSnapshot {
        LaneMetricsSnapshot {
            lane: self.lane.clone(),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            stalled: self.stalled.load(Ordering::Relaxed),
            transaction_failures: self.transaction_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            processing: self.processing.snapshot(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketSnapshot {
    /// `None` is the overflow bucket.
    pub le_ms: Option<u64>,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistogramSnapshot {
    pub buckets: Vec<BucketSnapshot>,
    pub count: u64,
    pub sum_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaneMetricsSnapshot {
    pub lane: String,
    pub completed: u64,
    pub failed: u64,
    pub stalled: u64,
    pub transaction_failures: u64,
    pub retries: u64,
    pub duplicates: u64,
    pub processing: HistogramSnapshot,
}

/// Process-wide collection of lane metrics.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    lanes: Mutex<BTreeMap<String, Arc<LaneMetrics>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Metrics for `lane`, created on first use.
    pub fn lane(&self, lane: &str) -> Arc<LaneMetrics> {
        let mut lanes = self.lanes.lock().unwrap();
        lanes
            .entry(lane.to_string())
            .or_insert_with(|| Arc::new(LaneMetrics::new(lane)))
            .clone()
    }

    pub fn snapshot(&self) -> Vec<LaneMetricsSnapshot> {
        let lanes = self.lanes.lock().unwrap();
        lanes.values().map(|m| m.snapshot()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_land_in_their_bucket() {
        let h = DurationHistogram::default();
        h.observe(Duration::from_millis(5));
        h.observe(Duration::from_millis(300));
        h.observe(Duration::from_secs(60));

        let snap = h.snapshot();
        assert_eq!(snap.count, 3);
        assert_eq!(snap.buckets[0].count, 1);
        assert_eq!(snap.buckets[4].le_ms, Some(500));
        assert_eq!(snap.buckets[4].count, 1);
        assert_eq!(snap.buckets.last().unwrap().le_ms, None);
        assert_eq!(snap.buckets.last().unwrap().count, 1);
    }

    #[test]
    fn registry_hands_out_shared_lane_metrics() {
        let registry = MetricsRegistry::new();
        registry.lane("files").record_stalled();
        registry.lane("files").record_retry();
        registry.lane("syncs").record_completed(Duration::from_millis(1));

        let snaps = registry.snapshot();
        assert_eq!(snaps.len(), 2);
        let files = snaps.iter().find(|s| s.lane == "files").unwrap();
        assert_eq!(files.stalled, 1);
        assert_eq!(files.retries, 1);
        assert_eq!(files.completed, 0);
    }
}
