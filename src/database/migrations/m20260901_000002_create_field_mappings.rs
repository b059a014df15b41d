use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(FieldMappings::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(FieldMappings::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(FieldMappings::ConnectionId)
                            .string_len(128)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(FieldMappings::EntityType)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(FieldMappings::FieldPath)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(FieldMappings::FullPath)
                            .string_len(320)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(FieldMappings::Depth)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(ColumnDef::new(FieldMappings::TargetTable).string_len(128))
                    .col(ColumnDef::new(FieldMappings::TargetColumn).string_len(128))
                    .col(ColumnDef::new(FieldMappings::TransformType).string_len(32))
                    .col(ColumnDef::new(FieldMappings::TransformConfig).text())
                    .col(ColumnDef::new(FieldMappings::SourceFields).text())
                    .col(
                        ColumnDef::new(FieldMappings::IsKey)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(FieldMappings::Enabled)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(FieldMappings::IsProtected)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(FieldMappings::AccessStatus)
                            .string_len(32)
                            .not_null()
                            .default("accessible"),
                    )
                    .col(
                        ColumnDef::new(FieldMappings::CreatedAt)
                            .timestamp()
                            .default(Expr::current_timestamp())
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(FieldMappings::UpdatedAt)
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
                    .name("idx_field_mappings_full_path")
                    .table(FieldMappings::Table)
                    .col(FieldMappings::ConnectionId)
                    .col(FieldMappings::FullPath)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(FieldMappings::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum FieldMappings {
    Table,
    Id,
    ConnectionId,
    EntityType,
    FieldPath,
    FullPath,
    Depth,
    TargetTable,
    TargetColumn,
    TransformType,
    TransformConfig,
    SourceFields,
    IsKey,
    Enabled,
    IsProtected,
    AccessStatus,
    CreatedAt,
    UpdatedAt,
}
