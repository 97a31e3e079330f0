//! # Data Models
//!
//! SeaORM entities for connections, metric records, webhook receipts and sync cursors.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod connection;
pub mod metric_record;
pub mod sync_cursor;
pub mod webhook_receipt;

pub use connection::Entity as Connection;
pub use metric_record::Entity as MetricRecord;
pub use sync_cursor::Entity as SyncCursor;
pub use webhook_receipt::Entity as WebhookReceipt;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "commerce-connectors".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
