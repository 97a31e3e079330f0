//! Migration to create the append-only webhook_receipts audit table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(WebhookReceipts::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(WebhookReceipts::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(WebhookReceipts::ConnectionId).uuid().not_null())
                    .col(ColumnDef::new(WebhookReceipts::Provider).text().not_null())
                    .col(ColumnDef::new(WebhookReceipts::Topic).text().not_null())
                    .col(ColumnDef::new(WebhookReceipts::ExternalId).text().not_null())
                    .col(
                        ColumnDef::new(WebhookReceipts::Status)
                            .text()
                            .not_null()
                            .default("received"),
                    )
                    .col(ColumnDef::new(WebhookReceipts::Error).text().null())
                    .col(
                        ColumnDef::new(WebhookReceipts::RecordsWritten)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(WebhookReceipts::ReceivedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(WebhookReceipts::ProcessedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_webhook_receipts_connection_id")
                            .from(WebhookReceipts::Table, WebhookReceipts::ConnectionId)
                            .to(Connections::Table, Connections::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_webhook_receipts_lookup")
                    .table(WebhookReceipts::Table)
                    .col(WebhookReceipts::ConnectionId)
                    .col(WebhookReceipts::Provider)
                    .col(WebhookReceipts::ExternalId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_webhook_receipts_lookup").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(WebhookReceipts::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum WebhookReceipts {
    Table,
    Id,
    ConnectionId,
    Provider,
    Topic,
    ExternalId,
    Status,
    Error,
    RecordsWritten,
    ReceivedAt,
    ProcessedAt,
}

#[derive(DeriveIden)]
enum Connections {
    Table,
    Id,
}
