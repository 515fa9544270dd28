use axum::{
    routing::{get, post},
    Router,
};

pub mod closure;
pub mod reruns;
pub mod system;

/// Router for the closure triggers and reruns.
pub fn router() -> Router {
    Router::new()
        .route("/changeset/closure", post(closure::close_changesets))
        .route("/file/closure", post(closure::close_files))
        .route("/sync/closure", post(closure::close_syncs))
        .route("/sync/:id/rerun", post(reruns::create_rerun))
        .route("/metrics", get(system::metrics))
}
