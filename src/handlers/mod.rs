//! # API Handlers
//!
//! HTTP endpoints for triggering syncs and fetches and for inspecting the
//! scheduler and the sync job history.

use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::{Value, json};

use crate::db;
use crate::error::ApiError;
use crate::models::ServiceInfo;
use crate::server::AppState;

pub mod scheduler;
pub mod sync;

/// Root handler that returns basic service information
pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo::default())
}

/// Liveness plus database reachability
pub async fn healthz(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    db::health_check(&state.db).await.map_err(|e| {
        tracing::warn!(error = %e, "Health check failed");
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVICE_UNAVAILABLE",
            "Database unavailable",
        )
    })?;
    Ok(Json(json!({ "status": "ok" })))
}
