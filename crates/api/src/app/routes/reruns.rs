use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::json;

use synctrack_core::{SyncId, TrackerError};
use synctrack_infra::{RerunOutcome, RerunParams};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub async fn create_rerun(
    Extension(services): Extension<Arc<AppServices>>,
    Path(base_sync_id): Path<String>,
    body: Bytes,
) -> axum::response::Response {
    let base_sync_id = match base_sync_id.parse::<SyncId>() {
        Ok(id) => id,
        Err(err) => return errors::tracker_error_to_response(err),
    };
    let body = match rerun_request(&body) {
        Ok(body) => body,
        Err(err) => return errors::tracker_error_to_response(err),
    };
    let params = RerunParams {
        id: body.id.map(SyncId::from_uuid).unwrap_or_default(),
        start_date: body.start_date.unwrap_or_else(Utc::now),
        metadata: body.metadata,
    };

    match services.create_rerun(base_sync_id, params).await {
        Ok(RerunOutcome::Created { sync }) => (
            StatusCode::CREATED,
            Json(json!({ "created": true, "sync": sync })),
        )
            .into_response(),
        Ok(RerunOutcome::NotCreated { closed }) => (
            StatusCode::OK,
            Json(json!({ "created": false, "closed": closed })),
        )
            .into_response(),
        Err(err) => errors::tracker_error_to_response(err),
    }
}

/// An empty body takes every default; anything else must be a valid request.
fn rerun_request(body: &[u8]) -> Result<dto::CreateRerunRequest, TrackerError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(dto::CreateRerunRequest::default());
    }
    Ok(serde_json::from_slice(body)?)
}
