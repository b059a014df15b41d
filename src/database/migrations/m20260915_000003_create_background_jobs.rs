use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(BackgroundJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(BackgroundJobs::Id)
                            .string_len(64)
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(BackgroundJobs::Family)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(BackgroundJobs::Status)
                            .string_len(32)
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(BackgroundJobs::ProgressPercent)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(BackgroundJobs::CurrentStep).string_len(255))
                    .col(ColumnDef::new(BackgroundJobs::CurrentStepDetail).string_len(1024))
                    .col(ColumnDef::new(BackgroundJobs::Metrics).text())
                    .col(ColumnDef::new(BackgroundJobs::OutputLocation).string_len(1024))
                    .col(ColumnDef::new(BackgroundJobs::OutputFilename).string_len(255))
                    .col(ColumnDef::new(BackgroundJobs::OutputSizeBytes).big_integer())
                    .col(ColumnDef::new(BackgroundJobs::ExpiresAt).timestamp())
                    .col(ColumnDef::new(BackgroundJobs::ErrorMessage).text())
                    .col(
                        ColumnDef::new(BackgroundJobs::CreatedAt)
                            .timestamp()
                            .default(Expr::current_timestamp())
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(BackgroundJobs::UpdatedAt)
                            .timestamp()
                            .default(Expr::current_timestamp())
                            .not_null(),
                    )
                    .col(ColumnDef::new(BackgroundJobs::StartedAt).timestamp())
                    .col(ColumnDef::new(BackgroundJobs::CompletedAt).timestamp())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_background_jobs_family_status")
                    .table(BackgroundJobs::Table)
                    .col(BackgroundJobs::Family)
                    .col(BackgroundJobs::Status)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(BackgroundJobs::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum BackgroundJobs {
    Table,
    Id,
    Family,
    Status,
    ProgressPercent,
    CurrentStep,
    CurrentStepDetail,
    Metrics,
    OutputLocation,
    OutputFilename,
    OutputSizeBytes,
    ExpiresAt,
    ErrorMessage,
    CreatedAt,
    UpdatedAt,
    StartedAt,
    CompletedAt,
}
