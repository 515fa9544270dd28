use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.ping().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => errors::json_error(StatusCode::SERVICE_UNAVAILABLE, "unavailable", err.to_string()),
    }
}

pub async fn metrics(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let counts = match services.lane_counts().await {
        Ok(counts) => counts,
        Err(err) => return errors::tracker_error_to_response(err),
    };
    let lanes: Vec<dto::LaneReport> = counts
        .into_iter()
        .map(|(lane, counts)| dto::LaneReport {
            lane,
            counts,
            metrics: services.metrics().lane(lane.name()).snapshot(),
        })
        .collect();
    Json(serde_json::json!({ "lanes": lanes })).into_response()
}
