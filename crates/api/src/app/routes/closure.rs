use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use synctrack_core::{ChangesetId, FileId, SyncId, TrackerError};
use synctrack_infra::jobs::JobKind;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub async fn close_changesets(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::ClosureRequest>,
) -> axum::response::Response {
    trigger::<ChangesetId>(&services, JobKind::ChangesetClosure, body).await
}

pub async fn close_files(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::ClosureRequest>,
) -> axum::response::Response {
    trigger::<FileId>(&services, JobKind::FileClosure, body).await
}

pub async fn close_syncs(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::ClosureRequest>,
) -> axum::response::Response {
    trigger::<SyncId>(&services, JobKind::SyncClosure, body).await
}

/// Validate the ids as `T` and queue their canonical form on the lane of
/// `kind`.
async fn trigger<T>(
    services: &AppServices,
    kind: JobKind,
    body: dto::ClosureRequest,
) -> axum::response::Response
where
    T: FromStr<Err = TrackerError> + Display,
{
    if body.ids.is_empty() {
        return errors::json_error(StatusCode::BAD_REQUEST, "invalid_payload", "ids must not be empty");
    }
    let ids = match body
        .ids
        .iter()
        .map(|id| id.parse::<T>().map(|id| id.to_string()))
        .collect::<Result<Vec<_>, _>>()
    {
        Ok(ids) => ids,
        Err(err) => return errors::tracker_error_to_response(err),
    };

    match services.queue().push(kind, &ids).await {
        Ok(report) => (
            StatusCode::CREATED,
            Json(dto::ClosureResponse::new(kind.lane(), report)),
        )
            .into_response(),
        Err(err) => errors::tracker_error_to_response(err),
    }
}
