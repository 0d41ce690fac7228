//! Request/response API (spec.md §6 route table).

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::jobs;
use crate::state::AppState;
use crate::websocket::websocket_handler;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/jobs", get(jobs::list_jobs))
        .route("/jobs/{id}", get(jobs::get_job).delete(jobs::delete_job))
        .route("/jobs/{id}/titles", get(jobs::list_titles))
        .route("/jobs/{id}/start", post(jobs::start_job))
        .route("/jobs/{id}/cancel", post(jobs::cancel_job))
        .route("/jobs/{id}/review", post(jobs::apply_review))
        .route("/jobs/{id}/process-matched", post(jobs::process_matched))
        .route("/config", get(jobs::get_config).put(jobs::put_config))
        .route("/ws", get(websocket_handler))
        .with_state(state)
}
