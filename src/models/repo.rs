//! Repo entity model
//!
//! This module contains the SeaORM entity model for the repo table, the
//! persisted view of every repository synced from a code host.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

/// Repo entity
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "repo")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Unique repo name, e.g. `github.com/org/repo`. Soft-deleted rows carry
    /// a `DELETED-<unix>-` prefix.
    pub name: String,

    pub uri: String,

    pub description: String,

    /// Code-host kind the repo identity belongs to
    pub external_service_type: Option<String>,

    /// Code-host instance identifier, usually its base URL
    pub external_service_id: Option<String>,

    /// Code-host native identifier of the repo
    pub external_id: Option<String>,

    pub archived: bool,

    pub fork: bool,

    pub private: bool,

    pub stars: i32,

    /// Code-host specific metadata as returned by the source
    #[sea_orm(column_type = "Json")]
    pub metadata: Option<JsonValue>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,

    /// Set when the repo is soft-deleted
    pub deleted_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::external_service_repo::Entity")]
    ExternalServiceRepo,
}

impl Related<super::external_service_repo::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ExternalServiceRepo.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
