//! External service operations.

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait, Unchanged,
};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use super::{Store, StoreError};
use crate::models::external_service;
use crate::types::{ExternalService, ExternalServiceId};

/// Fields for a new external service.
#[derive(Debug, Clone, Deserialize)]
pub struct NewExternalService {
    pub kind: String,
    pub display_name: String,
    pub config: JsonValue,
    #[serde(default)]
    pub namespace_user_id: Option<i32>,
    #[serde(default)]
    pub namespace_org_id: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct ListExternalServicesOptions {
    pub ids: Vec<ExternalServiceId>,
    /// Matched case-insensitively
    pub kinds: Vec<String>,
    /// Only services never synced or whose `next_sync_at` is at or before this
    pub due_before: Option<DateTime<Utc>>,
    pub include_deleted: bool,
}

impl<C> Store<C>
where
    C: ConnectionTrait + TransactionTrait,
{
    pub async fn create_external_service(
        &self,
        new: NewExternalService,
    ) -> Result<ExternalService, StoreError> {
        let now = self.now().fixed_offset();
        let model = external_service::ActiveModel {
            kind: Set(new.kind.to_uppercase()),
            display_name: Set(new.display_name),
            config: Set(new.config),
            namespace_user_id: Set(new.namespace_user_id),
            namespace_org_id: Set(new.namespace_org_id),
            last_sync_at: Set(None),
            next_sync_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            deleted_at: Set(None),
            ..Default::default()
        }
        .insert(self.conn())
        .await?;

        tracing::info!(
            external_service_id = model.id,
            kind = %model.kind,
            "External service created"
        );
        Ok(model.into())
    }

    /// Fetches a non-deleted external service.
    pub async fn get_external_service(
        &self,
        id: ExternalServiceId,
    ) -> Result<ExternalService, StoreError> {
        external_service::Entity::find_by_id(id)
            .filter(external_service::Column::DeletedAt.is_null())
            .one(self.conn())
            .await?
            .map(ExternalService::from)
            .ok_or(StoreError::ExternalServiceNotFound(id))
    }

    pub async fn list_external_services(
        &self,
        opts: &ListExternalServicesOptions,
    ) -> Result<Vec<ExternalService>, StoreError> {
        let mut query = external_service::Entity::find();
        if !opts.ids.is_empty() {
            query = query.filter(external_service::Column::Id.is_in(opts.ids.iter().copied()));
        }
        if !opts.kinds.is_empty() {
            query = query.filter(
                external_service::Column::Kind
                    .is_in(opts.kinds.iter().map(|kind| kind.to_uppercase())),
            );
        }
        if let Some(due) = opts.due_before {
            query = query.filter(
                Condition::any()
                    .add(external_service::Column::NextSyncAt.is_null())
                    .add(external_service::Column::NextSyncAt.lte(due.fixed_offset())),
            );
        }
        if !opts.include_deleted {
            query = query.filter(external_service::Column::DeletedAt.is_null());
        }

        let models = query
            .order_by_asc(external_service::Column::Id)
            .all(self.conn())
            .await?;
        Ok(models.into_iter().map(ExternalService::from).collect())
    }

    /// Records the outcome of a sync pass.
    pub async fn update_external_service_sync_times(
        &self,
        id: ExternalServiceId,
        last_sync_at: DateTime<Utc>,
        next_sync_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        external_service::ActiveModel {
            id: Unchanged(id),
            last_sync_at: Set(Some(last_sync_at.fixed_offset())),
            next_sync_at: Set(Some(next_sync_at.fixed_offset())),
            updated_at: Set(self.now().fixed_offset()),
            ..Default::default()
        }
        .update(self.conn())
        .await
        .map_err(|e| match e {
            sea_orm::DbErr::RecordNotUpdated => StoreError::ExternalServiceNotFound(id),
            other => StoreError::Db(other),
        })?;
        Ok(())
    }

    /// Moves the next sync of a service, e.g. to make it due right away.
    pub async fn set_next_sync_at(
        &self,
        id: ExternalServiceId,
        next_sync_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = external_service::Entity::update_many()
            .col_expr(
                external_service::Column::NextSyncAt,
                sea_orm::sea_query::Expr::value(next_sync_at.fixed_offset()),
            )
            .filter(external_service::Column::Id.eq(id))
            .filter(external_service::Column::DeletedAt.is_null())
            .exec(self.conn())
            .await?;
        if result.rows_affected == 0 {
            return Err(StoreError::ExternalServiceNotFound(id));
        }
        Ok(())
    }
}
