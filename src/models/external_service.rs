//! ExternalService entity model
//!
//! This module contains the SeaORM entity model for the external_services
//! table: configured connections to code hosts and their sync bookkeeping.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

/// ExternalService entity
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "external_services")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Code-host kind, e.g. `GITHUB` or `OTHER`
    pub kind: String,

    pub display_name: String,

    /// Kind-specific source configuration
    #[sea_orm(column_type = "Json")]
    pub config: JsonValue,

    /// Owning user for user-added services
    pub namespace_user_id: Option<i32>,

    /// Owning organization for org-added services
    pub namespace_org_id: Option<i32>,

    /// When the last sync pass finished
    pub last_sync_at: Option<DateTimeWithTimeZone>,

    /// When the next sync pass is due
    pub next_sync_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,

    pub deleted_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::external_service_repo::Entity")]
    ExternalServiceRepo,
    #[sea_orm(has_many = "super::sync_job::Entity")]
    SyncJob,
}

impl Related<super::external_service_repo::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ExternalServiceRepo.def()
    }
}

impl Related<super::sync_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SyncJob.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
