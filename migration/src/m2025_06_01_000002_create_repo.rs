//! Migration to create the repo table.
//!
//! Repo names are unique across live and soft-deleted rows; soft deletion
//! renames the row out of the way. The external repo triple is unique too.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Repo::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Repo::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Repo::Name).text().not_null())
                    .col(ColumnDef::new(Repo::Uri).text().not_null().default(""))
                    .col(ColumnDef::new(Repo::Description).text().not_null().default(""))
                    .col(ColumnDef::new(Repo::ExternalServiceType).text().null())
                    .col(ColumnDef::new(Repo::ExternalServiceId).text().null())
                    .col(ColumnDef::new(Repo::ExternalId).text().null())
                    .col(ColumnDef::new(Repo::Archived).boolean().not_null().default(false))
                    .col(ColumnDef::new(Repo::Fork).boolean().not_null().default(false))
                    .col(ColumnDef::new(Repo::Private).boolean().not_null().default(false))
                    .col(ColumnDef::new(Repo::Stars).integer().not_null().default(0))
                    .col(ColumnDef::new(Repo::Metadata).json().null())
                    .col(
                        ColumnDef::new(Repo::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Repo::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(Repo::DeletedAt).timestamp_with_time_zone().null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_repo_name_unique")
                    .table(Repo::Table)
                    .col(Repo::Name)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_repo_external_unique")
                    .table(Repo::Table)
                    .col(Repo::ExternalServiceType)
                    .col(Repo::ExternalServiceId)
                    .col(Repo::ExternalId)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_repo_external_unique").to_owned())
            .await?;
        manager
            .drop_index(Index::drop().name("idx_repo_name_unique").to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Repo::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Repo {
    Table,
    Id,
    Name,
    Uri,
    Description,
    ExternalServiceType,
    ExternalServiceId,
    ExternalId,
    Archived,
    Fork,
    Private,
    Stars,
    Metadata,
    CreatedAt,
    UpdatedAt,
    DeletedAt,
}
