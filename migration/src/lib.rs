//! Database migrations for the commerce connectors service.

pub use sea_orm_migration::prelude::*;

mod m2026_10_01_000001_create_connections;
mod m2026_10_01_000002_create_metric_records;
mod m2026_10_01_000003_create_webhook_receipts;
mod m2026_10_01_000004_create_sync_cursors;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_10_01_000001_create_connections::Migration),
            Box::new(m2026_10_01_000002_create_metric_records::Migration),
            Box::new(m2026_10_01_000003_create_webhook_receipts::Migration),
            Box::new(m2026_10_01_000004_create_sync_cursors::Migration),
        ]
    }
}
