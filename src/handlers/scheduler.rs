//! Scheduler endpoints.

use axum::{
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;

use crate::error::{ApiError, ErrorType};
use crate::scheduler::{RepoScheduleInfo, SchedulerDump};
use crate::server::AppState;
use crate::types::{ConfiguredRepo, RepoId};

#[derive(Debug, Deserialize)]
pub struct EnqueueRepoUpdateRequest {
    pub repo: String,
}

/// Queues a high-priority fetch of a stored repo.
pub async fn enqueue_repo_update(
    State(state): State<AppState>,
    payload: Result<Json<EnqueueRepoUpdateRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ConfiguredRepo>), ApiError> {
    let Json(request) = payload?;
    let Some(repo) = state.store.get_repo_by_name(&request.repo).await? else {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            &format!("Repo {} not found", request.repo),
        ));
    };

    let configured = repo.configured();
    state.scheduler.update_once(configured.clone());
    Ok((StatusCode::ACCEPTED, Json(configured)))
}

/// Schedule and queue position of one repo.
pub async fn schedule_info(
    State(state): State<AppState>,
    Path(repo_id): Path<i32>,
) -> Result<Json<RepoScheduleInfo>, ApiError> {
    let info = state.scheduler.schedule_info(RepoId(repo_id));
    if info.schedule.is_none() && info.queue.is_none() {
        return Err(ErrorType::NotFound.into());
    }
    Ok(Json(info))
}

/// Copies of both scheduler heaps and the limiter state.
pub async fn debug_dump(State(state): State<AppState>) -> Json<SchedulerDump> {
    Json(state.scheduler.debug_dump())
}
