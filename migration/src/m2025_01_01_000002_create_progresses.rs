//! Migration to create the progresses table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Progresses::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Progresses::JobName)
                            .string_len(512)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Progresses::Progress).text().not_null())
                    .col(
                        ColumnDef::new(Progresses::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Progresses::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Progresses {
    Table,
    JobName,
    Progress,
    UpdatedAt,
}
