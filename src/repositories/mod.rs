//! # Repository Layer
//!
//! Repository implementations that encapsulate SeaORM operations for connections, metric
//! records, webhook receipts, and sync cursors.

pub mod connection;
pub mod connection_settings;
pub mod metric_record;
pub mod sync_cursor;
pub mod webhook_receipt;

pub use connection::{ConnectionRepository, CreateConnectionError, NewConnection};
pub use connection_settings::ConnectionSyncSettings;
pub use metric_record::{CursorData, MetricWriter, WriteSummary};
pub use sync_cursor::{ResumePoint, SyncCursorRepository};
pub use webhook_receipt::{ReceiptOutcome, WebhookReceiptRepository};
