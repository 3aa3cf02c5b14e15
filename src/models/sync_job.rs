//! SyncJob entity model
//!
//! This module contains the SeaORM entity model for the sync_jobs table. Each
//! row is one sync pass over an external service and the progress counters
//! recorded while it ran.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

/// Job is running
pub const STATE_PROCESSING: &str = "processing";
/// Job finished without errors
pub const STATE_COMPLETED: &str = "completed";
/// Job finished with at least one error
pub const STATE_ERRORED: &str = "errored";

/// SyncJob entity representing one sync pass
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_jobs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// External service the pass ran against
    pub external_service_id: i32,

    /// One of `processing`, `completed`, `errored`
    pub state: String,

    /// Aggregated error message when the pass errored
    pub failure_message: Option<String>,

    pub started_at: DateTimeWithTimeZone,

    pub finished_at: Option<DateTimeWithTimeZone>,

    pub repos_synced: i32,
    pub repos_errored: i32,
    pub repos_added: i32,
    pub repos_removed: i32,
    pub repos_modified: i32,
    pub repos_unmodified: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::external_service::Entity",
        from = "Column::ExternalServiceId",
        to = "super::external_service::Column::Id"
    )]
    ExternalService,
}

impl Related<super::external_service::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ExternalService.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
