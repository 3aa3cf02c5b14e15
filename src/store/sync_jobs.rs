//! Sync job bookkeeping: one row per sync pass over an external service.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, TransactionTrait, Unchanged,
};
use serde::Serialize;

use super::{Store, StoreError};
use crate::models::sync_job::{self, STATE_COMPLETED, STATE_ERRORED, STATE_PROCESSING};
use crate::types::{ExternalServiceId, SyncProgress};

/// A sync pass as exposed on the debug endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncJobRecord {
    pub id: i32,
    pub external_service_id: ExternalServiceId,
    pub state: String,
    pub failure_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub progress: SyncProgress,
}

impl From<sync_job::Model> for SyncJobRecord {
    fn from(model: sync_job::Model) -> Self {
        Self {
            id: model.id,
            external_service_id: model.external_service_id,
            state: model.state,
            failure_message: model.failure_message,
            started_at: model.started_at.with_timezone(&Utc),
            finished_at: model.finished_at.map(|at| at.with_timezone(&Utc)),
            progress: SyncProgress {
                synced: model.repos_synced,
                errors: model.repos_errored,
                added: model.repos_added,
                removed: model.repos_removed,
                modified: model.repos_modified,
                unmodified: model.repos_unmodified,
            },
        }
    }
}

fn progress_columns(model: &mut sync_job::ActiveModel, progress: &SyncProgress) {
    model.repos_synced = Set(progress.synced);
    model.repos_errored = Set(progress.errors);
    model.repos_added = Set(progress.added);
    model.repos_removed = Set(progress.removed);
    model.repos_modified = Set(progress.modified);
    model.repos_unmodified = Set(progress.unmodified);
}

impl<C> Store<C>
where
    C: ConnectionTrait + TransactionTrait,
{
    /// Opens a `processing` job for a sync pass.
    pub async fn create_sync_job(
        &self,
        external_service_id: ExternalServiceId,
    ) -> Result<SyncJobRecord, StoreError> {
        let model = sync_job::ActiveModel {
            external_service_id: Set(external_service_id),
            state: Set(STATE_PROCESSING.to_string()),
            failure_message: Set(None),
            started_at: Set(self.now().fixed_offset()),
            finished_at: Set(None),
            repos_synced: Set(0),
            repos_errored: Set(0),
            repos_added: Set(0),
            repos_removed: Set(0),
            repos_modified: Set(0),
            repos_unmodified: Set(0),
            ..Default::default()
        }
        .insert(self.conn())
        .await?;

        tracing::debug!(
            job_id = model.id,
            external_service_id,
            "Sync job started"
        );
        Ok(model.into())
    }

    pub async fn record_sync_progress(
        &self,
        job_id: i32,
        progress: &SyncProgress,
    ) -> Result<(), StoreError> {
        let mut model = sync_job::ActiveModel {
            id: Unchanged(job_id),
            ..Default::default()
        };
        progress_columns(&mut model, progress);
        model.update(self.conn()).await?;
        Ok(())
    }

    /// Closes a job as `completed`, or `errored` when a failure message is given.
    pub async fn finish_sync_job(
        &self,
        job_id: i32,
        progress: &SyncProgress,
        failure_message: Option<String>,
    ) -> Result<(), StoreError> {
        let state = if failure_message.is_some() {
            STATE_ERRORED
        } else {
            STATE_COMPLETED
        };
        let mut model = sync_job::ActiveModel {
            id: Unchanged(job_id),
            state: Set(state.to_string()),
            failure_message: Set(failure_message),
            finished_at: Set(Some(self.now().fixed_offset())),
            ..Default::default()
        };
        progress_columns(&mut model, progress);
        model.update(self.conn()).await?;
        Ok(())
    }

    /// Most recent jobs first, optionally for one service.
    pub async fn list_sync_jobs(
        &self,
        external_service_id: Option<ExternalServiceId>,
        limit: u64,
    ) -> Result<Vec<SyncJobRecord>, StoreError> {
        let mut query = sync_job::Entity::find();
        if let Some(id) = external_service_id {
            query = query.filter(sync_job::Column::ExternalServiceId.eq(id));
        }
        let models = query
            .order_by_desc(sync_job::Column::StartedAt)
            .order_by_desc(sync_job::Column::Id)
            .limit(limit)
            .all(self.conn())
            .await?;
        Ok(models.into_iter().map(SyncJobRecord::from).collect())
    }

    /// Marks jobs left `processing` by a previous process as errored.
    pub async fn reset_interrupted_sync_jobs(&self) -> Result<u64, StoreError> {
        let result = sync_job::Entity::update_many()
            .col_expr(sync_job::Column::State, Expr::value(STATE_ERRORED))
            .col_expr(
                sync_job::Column::FailureMessage,
                Expr::value("interrupted before completion"),
            )
            .col_expr(
                sync_job::Column::FinishedAt,
                Expr::value(self.now().fixed_offset()),
            )
            .filter(sync_job::Column::State.eq(STATE_PROCESSING))
            .exec(self.conn())
            .await?;
        Ok(result.rows_affected)
    }
}
