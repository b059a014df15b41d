use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(JobQueue::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(JobQueue::Family).string_len(32).not_null())
                    .col(ColumnDef::new(JobQueue::JobId).string_len(64).not_null())
                    .col(ColumnDef::new(JobQueue::Payload).text().not_null())
                    .col(
                        ColumnDef::new(JobQueue::State)
                            .string_len(16)
                            .not_null()
                            .default("queued"),
                    )
                    .col(
                        ColumnDef::new(JobQueue::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(JobQueue::EnqueuedAt)
                            .timestamp()
                            .default(Expr::current_timestamp())
                            .not_null(),
                    )
                    .col(ColumnDef::new(JobQueue::LockedAt).timestamp())
                    .primary_key(Index::create().col(JobQueue::Family).col(JobQueue::JobId))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_job_queue_family_state")
                    .table(JobQueue::Table)
                    .col(JobQueue::Family)
                    .col(JobQueue::State)
                    .col(JobQueue::EnqueuedAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(JobQueue::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum JobQueue {
    Table,
    Family,
    JobId,
    Payload,
    State,
    Attempts,
    EnqueuedAt,
    LockedAt,
}
