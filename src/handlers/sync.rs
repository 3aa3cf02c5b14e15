//! Sync endpoints: external services, single repos and sync job history.

use axum::{
    extract::{Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, validation_error};
use crate::server::AppState;
use crate::store::{NewExternalService, SyncJobRecord};
use crate::types::{ExternalService, ExternalServiceId, Repo};

const DEFAULT_JOBS_LIMIT: u64 = 50;
const MAX_JOBS_LIMIT: u64 = 500;

#[derive(Debug, Deserialize)]
pub struct SyncExternalServiceRequest {
    pub external_service_id: ExternalServiceId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncExternalServiceResponse {
    pub external_service_id: ExternalServiceId,
    pub triggered: bool,
}

/// Makes an external service due for sync right away.
pub async fn sync_external_service(
    State(state): State<AppState>,
    payload: Result<Json<SyncExternalServiceRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SyncExternalServiceResponse>), ApiError> {
    let Json(request) = payload?;
    state
        .syncer
        .trigger_external_service_sync(request.external_service_id)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SyncExternalServiceResponse {
            external_service_id: request.external_service_id,
            triggered: true,
        }),
    ))
}

/// Registers an external service and schedules its first sync.
pub async fn create_external_service(
    State(state): State<AppState>,
    payload: Result<Json<NewExternalService>, JsonRejection>,
) -> Result<(StatusCode, Json<ExternalService>), ApiError> {
    let Json(new) = payload?;
    if new.kind.trim().is_empty() {
        return Err(validation_error(
            "Invalid external service",
            serde_json::json!({ "kind": "must not be empty" }),
        ));
    }
    if !new.config.is_object() {
        return Err(validation_error(
            "Invalid external service",
            serde_json::json!({ "config": "must be a JSON object" }),
        ));
    }

    let svc = state.store.create_external_service(new).await?;
    state.syncer.trigger_external_service_sync(svc.id).await?;
    Ok((StatusCode::CREATED, Json(svc)))
}

#[derive(Debug, Deserialize)]
pub struct SyncRepoRequest {
    pub repo: String,
    #[serde(default)]
    pub background: bool,
}

/// Returns a repo by name, looking it up on the code hosts when needed.
pub async fn sync_repo(
    State(state): State<AppState>,
    payload: Result<Json<SyncRepoRequest>, JsonRejection>,
) -> Result<Json<Repo>, ApiError> {
    let Json(request) = payload?;
    if request.repo.trim().is_empty() {
        return Err(validation_error(
            "Invalid repo",
            serde_json::json!({ "repo": "must not be empty" }),
        ));
    }
    let repo = state
        .syncer
        .sync_repo(&request.repo, request.background)
        .await?;
    Ok(Json(repo))
}

#[derive(Debug, Deserialize)]
pub struct ListSyncJobsQuery {
    pub external_service_id: Option<ExternalServiceId>,
    /// Maximum number of jobs to return (default: 50, max: 500)
    pub limit: Option<u64>,
}

/// Most recent sync jobs first.
pub async fn list_sync_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListSyncJobsQuery>,
) -> Result<Json<Vec<SyncJobRecord>>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_JOBS_LIMIT);
    if limit == 0 || limit > MAX_JOBS_LIMIT {
        return Err(validation_error(
            "Invalid limit",
            serde_json::json!({ "limit": format!("must be between 1 and {MAX_JOBS_LIMIT}") }),
        ));
    }

    let jobs = state
        .store
        .list_sync_jobs(params.external_service_id, limit)
        .await?;
    Ok(Json(jobs))
}
