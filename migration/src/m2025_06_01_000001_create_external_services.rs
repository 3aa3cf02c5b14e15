//! Migration to create the external_services table.
//!
//! An external service is a configured connection to a code host. Its sync
//! bookkeeping (`last_sync_at`, `next_sync_at`) drives the periodic sync runner.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ExternalServices::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ExternalServices::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ExternalServices::Kind).text().not_null())
                    .col(ColumnDef::new(ExternalServices::DisplayName).text().not_null())
                    .col(ColumnDef::new(ExternalServices::Config).json().not_null())
                    .col(ColumnDef::new(ExternalServices::NamespaceUserId).integer().null())
                    .col(ColumnDef::new(ExternalServices::NamespaceOrgId).integer().null())
                    .col(
                        ColumnDef::new(ExternalServices::LastSyncAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ExternalServices::NextSyncAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ExternalServices::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ExternalServices::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ExternalServices::DeletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        // The sync runner polls for services that are due.
        manager
            .create_index(
                Index::create()
                    .name("idx_external_services_next_sync_at")
                    .table(ExternalServices::Table)
                    .col(ExternalServices::NextSyncAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_external_services_next_sync_at")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(ExternalServices::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ExternalServices {
    Table,
    Id,
    Kind,
    DisplayName,
    Config,
    NamespaceUserId,
    NamespaceOrgId,
    LastSyncAt,
    NextSyncAt,
    CreatedAt,
    UpdatedAt,
    DeletedAt,
}
