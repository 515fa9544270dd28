use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use synctrack_infra::jobs::{Lane, LaneCounts, PushReport};
use synctrack_observability::LaneMetricsSnapshot;

#[derive(Debug, Deserialize)]
pub struct ClosureRequest {
    pub ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ClosureResponse {
    pub lane: Lane,
    pub enqueued: Vec<String>,
    pub deduplicated: Vec<String>,
}

impl ClosureResponse {
    pub fn new(lane: Lane, report: PushReport) -> Self {
        Self {
            lane,
            enqueued: report.enqueued,
            deduplicated: report.deduplicated,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateRerunRequest {
    /// Id of the new rerun; generated when absent.
    pub id: Option<uuid::Uuid>,
    pub start_date: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct LaneReport {
    pub lane: Lane,
    pub counts: LaneCounts,
    pub metrics: LaneMetricsSnapshot,
}
