//! Migration to create the metric_records table.
//!
//! Metric records are the canonical, deduplicated facts derived from provider events.
//! `(connection_id, source_event_id, metric_type)` is the idempotency key.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(MetricRecords::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(MetricRecords::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(MetricRecords::ConnectionId).uuid().not_null())
                    .col(ColumnDef::new(MetricRecords::MetricType).text().not_null())
                    .col(ColumnDef::new(MetricRecords::Value).double().not_null())
                    .col(ColumnDef::new(MetricRecords::Currency).text().null())
                    .col(ColumnDef::new(MetricRecords::Source).text().not_null())
                    .col(ColumnDef::new(MetricRecords::SourceEventId).text().not_null())
                    .col(ColumnDef::new(MetricRecords::Metadata).json_binary().not_null())
                    .col(
                        ColumnDef::new(MetricRecords::OccurredAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(MetricRecords::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_metric_records_connection_id")
                            .from(MetricRecords::Table, MetricRecords::ConnectionId)
                            .to(Connections::Table, Connections::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_metric_records_idempotency")
                    .table(MetricRecords::Table)
                    .col(MetricRecords::ConnectionId)
                    .col(MetricRecords::SourceEventId)
                    .col(MetricRecords::MetricType)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_metric_records_connection_occurred")
                    .table(MetricRecords::Table)
                    .col(MetricRecords::ConnectionId)
                    .col(MetricRecords::OccurredAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_metric_records_connection_occurred")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(Index::drop().name("idx_metric_records_idempotency").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(MetricRecords::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum MetricRecords {
    Table,
    Id,
    ConnectionId,
    MetricType,
    Value,
    Currency,
    Source,
    SourceEventId,
    Metadata,
    OccurredAt,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Connections {
    Table,
    Id,
}
