//! Migration to create the sync_jobs table.
//!
//! Each row records one sync pass over an external service together with the
//! progress counters reported while it ran.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncJobs::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SyncJobs::ExternalServiceId).integer().not_null())
                    .col(
                        ColumnDef::new(SyncJobs::State)
                            .text()
                            .not_null()
                            .default("processing"),
                    )
                    .col(ColumnDef::new(SyncJobs::FailureMessage).text().null())
                    .col(
                        ColumnDef::new(SyncJobs::StartedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(SyncJobs::FinishedAt).timestamp_with_time_zone().null())
                    .col(ColumnDef::new(SyncJobs::ReposSynced).integer().not_null().default(0))
                    .col(ColumnDef::new(SyncJobs::ReposErrored).integer().not_null().default(0))
                    .col(ColumnDef::new(SyncJobs::ReposAdded).integer().not_null().default(0))
                    .col(ColumnDef::new(SyncJobs::ReposRemoved).integer().not_null().default(0))
                    .col(ColumnDef::new(SyncJobs::ReposModified).integer().not_null().default(0))
                    .col(
                        ColumnDef::new(SyncJobs::ReposUnmodified)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sync_jobs_external_service_id")
                            .from(SyncJobs::Table, SyncJobs::ExternalServiceId)
                            .to(ExternalServices::Table, ExternalServices::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Listing recent jobs per service, newest first.
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_sync_jobs_service_started ON sync_jobs (external_service_id, started_at DESC)".to_string(),
            ))
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_sync_jobs_service_started").to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(SyncJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncJobs {
    Table,
    Id,
    ExternalServiceId,
    State,
    FailureMessage,
    StartedAt,
    FinishedAt,
    ReposSynced,
    ReposErrored,
    ReposAdded,
    ReposRemoved,
    ReposModified,
    ReposUnmodified,
}

#[derive(DeriveIden)]
enum ExternalServices {
    Table,
    Id,
}
