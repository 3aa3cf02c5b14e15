//! ExternalServiceRepo entity model
//!
//! Join rows linking an external service to each repo it yielded, with the
//! clone URL it yielded it under.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "external_service_repos")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub external_service_id: i32,

    #[sea_orm(primary_key, auto_increment = false)]
    pub repo_id: i32,

    pub clone_url: String,

    pub user_id: Option<i32>,

    pub org_id: Option<i32>,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::external_service::Entity",
        from = "Column::ExternalServiceId",
        to = "super::external_service::Column::Id"
    )]
    ExternalService,
    #[sea_orm(
        belongs_to = "super::repo::Entity",
        from = "Column::RepoId",
        to = "super::repo::Column::Id"
    )]
    Repo,
}

impl Related<super::external_service::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ExternalService.def()
    }
}

impl Related<super::repo::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Repo.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
