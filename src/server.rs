//! # Server Configuration
//!
//! Router and listener for the operational HTTP surface.

use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::handlers;
use crate::scheduler::UpdateScheduler;
use crate::store::Store;
use crate::syncer::Syncer;
use crate::telemetry;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub store: Store,
    pub syncer: Arc<Syncer>,
    pub scheduler: Arc<UpdateScheduler>,
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route(
            "/external-services",
            post(handlers::sync::create_external_service),
        )
        .route(
            "/sync-external-service",
            post(handlers::sync::sync_external_service),
        )
        .route("/sync-repo", post(handlers::sync::sync_repo))
        .route(
            "/enqueue-repo-update",
            post(handlers::scheduler::enqueue_repo_update),
        )
        .route(
            "/schedule-info/{repo_id}",
            get(handlers::scheduler::schedule_info),
        )
        .route("/debug/scheduler", get(handlers::scheduler::debug_dump))
        .route("/debug/sync-jobs", get(handlers::sync::list_sync_jobs))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(telemetry::trace_context_middleware))
        .with_state(state)
}

/// Serves the router until `shutdown` is cancelled.
pub async fn run_server(state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = state
        .config
        .bind_addr()
        .map_err(|e| anyhow::anyhow!("Invalid server address: {}", e))?;
    let profile = state.config.profile.clone();
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, %profile, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
