//! Job/title HTTP handlers (spec.md §6 request/response API table).

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use spindle_core::ids::{JobId, TitleId};
use spindle_core::persistence::Store;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

const RECENT_JOBS_LIMIT: usize = 10;

fn parse_job_id(raw: &str) -> AppResult<JobId> {
    raw.parse::<i64>()
        .map(JobId)
        .map_err(|_| AppError::bad_request(format!("invalid job id: {raw}")))
}

fn parse_title_id(raw: i64) -> TitleId {
    TitleId(raw)
}

pub async fn list_jobs(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let jobs = state.store.list_recent_jobs(RECENT_JOBS_LIMIT).await?;
    Ok(Json(json!({ "jobs": jobs })))
}

pub async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Value>> {
    let job_id = parse_job_id(&id)?;
    let job = state
        .store
        .get_job(job_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("job {job_id} not found")))?;
    Ok(Json(json!({ "job": job })))
}

pub async fn list_titles(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Value>> {
    let job_id = parse_job_id(&id)?;
    let titles = state.store.list_titles_for_job(job_id).await?;
    Ok(Json(json!({ "titles": titles })))
}

pub async fn start_job(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Value>> {
    let job_id = parse_job_id(&id)?;
    if !state.config.read().await.setup_complete {
        return Err(AppError::unprocessable(
            "setup is not complete: library paths must be configured before a job can start",
        ));
    }
    state.orchestrator.start_job(job_id).await?;
    Ok(Json(json!({ "status": "started" })))
}

pub async fn cancel_job(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Value>> {
    let job_id = parse_job_id(&id)?;
    state.orchestrator.cancel_job(job_id).await?;
    Ok(Json(json!({ "status": "cancelled" })))
}

#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    title_id: i64,
    episode_code: Option<String>,
    edition: Option<String>,
}

pub async fn apply_review(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReviewRequest>,
) -> AppResult<Json<Value>> {
    let job_id = parse_job_id(&id)?;
    let title_id = parse_title_id(body.title_id);
    state
        .orchestrator
        .apply_review(job_id, title_id, body.episode_code, body.edition)
        .await?;
    Ok(Json(json!({ "status": "applied" })))
}

pub async fn process_matched(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let job_id = parse_job_id(&id)?;
    state.orchestrator.process_matched_titles(job_id).await?;
    Ok(Json(json!({ "status": "processing" })))
}

pub async fn delete_job(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Value>> {
    let job_id = parse_job_id(&id)?;
    let job = state
        .store
        .get_job(job_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("job {job_id} not found")))?;

    if !job.state.is_terminal() {
        return Err(AppError::bad_request(format!(
            "cannot delete job {job_id} in state {:?}; must be completed or failed",
            job.state
        )));
    }

    state.store.delete_job(job_id).await?;
    Ok(Json(json!({ "status": "deleted" })))
}

pub async fn get_config(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let config = state.config.read().await;
    Ok(Json(spindle_config::redacted_json(&config)?))
}

pub async fn put_config(
    State(state): State<AppState>,
    Json(patch): Json<Value>,
) -> AppResult<Json<Value>> {
    let mut config = state.config.write().await;
    config.merge_patch(patch)?;

    state
        .organizer
        .update_settings(
            config.paths.library_movies_path.clone(),
            config.paths.library_tv_path.clone(),
            config.conflict_resolution_default,
        )
        .await;

    Ok(Json(spindle_config::redacted_json(&config)?))
}
