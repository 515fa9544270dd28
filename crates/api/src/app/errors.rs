use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use synctrack_core::{ErrorKind, TrackerError};

pub fn tracker_error_to_response(err: TrackerError) -> axum::response::Response {
    match err.kind() {
        ErrorKind::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        ErrorKind::AlreadyExists => {
            json_error(StatusCode::CONFLICT, "already_exists", err.to_string())
        }
        ErrorKind::Conflict => json_error(StatusCode::CONFLICT, "conflict", err.to_string()),
        ErrorKind::InvalidPayload => {
            json_error(StatusCode::BAD_REQUEST, "invalid_payload", err.to_string())
        }
        ErrorKind::TransactionFailure | ErrorKind::ExceededNumberOfRetries => {
            tracing::warn!(error = %err, "transaction retries exhausted");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "transaction_failure",
                err.to_string(),
            )
        }
        ErrorKind::Storage | ErrorKind::Queue => {
            tracing::error!(error = %err, "request failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", err.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
