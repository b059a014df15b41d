use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SchemaCache::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SchemaCache::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(SchemaCache::ConnectionId)
                            .string_len(128)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SchemaCache::Category)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SchemaCache::TypeName)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(ColumnDef::new(SchemaCache::SchemaJson).text().not_null())
                    .col(
                        ColumnDef::new(SchemaCache::CreatedAt)
                            .timestamp()
                            .default(Expr::current_timestamp())
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SchemaCache::UpdatedAt)
                            .timestamp()
                            .default(Expr::current_timestamp())
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_schema_cache_natural_key")
                    .table(SchemaCache::Table)
                    .col(SchemaCache::ConnectionId)
                    .col(SchemaCache::Category)
                    .col(SchemaCache::TypeName)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SchemaCache::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum SchemaCache {
    Table,
    Id,
    ConnectionId,
    Category,
    TypeName,
    SchemaJson,
    CreatedAt,
    UpdatedAt,
}
