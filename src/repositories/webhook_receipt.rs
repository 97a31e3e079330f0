//! Webhook receipt repository
//!
//! Audit trail for authenticated deliveries and the duplicate pre-check that lets a
//! redelivered webhook short-circuit before normalization.

use anyhow::{Result, anyhow};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::webhook_receipt::{
    self, Column, Entity as WebhookReceipt, STATUS_FAILED, STATUS_PROCESSED, STATUS_RECEIVED,
};

/// Terminal state of a delivery. An ignored kind is stored as `processed` with nothing
/// written, so redeliveries of it are still duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptOutcome {
    Processed { records_written: u64 },
    Ignored,
    Failed,
}

impl ReceiptOutcome {
    fn status(&self) -> &'static str {
        match self {
            Self::Processed { .. } | Self::Ignored => STATUS_PROCESSED,
            Self::Failed => STATUS_FAILED,
        }
    }

    fn records_written(&self) -> u64 {
        match self {
            Self::Processed { records_written } => *records_written,
            Self::Ignored | Self::Failed => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookReceiptRepository {
    db: Arc<DatabaseConnection>,
}

impl WebhookReceiptRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn record_received(
        &self,
        connection_id: Uuid,
        provider: &str,
        topic: &str,
        external_id: &str,
    ) -> Result<webhook_receipt::Model> {
        let receipt = webhook_receipt::ActiveModel {
            id: Set(Uuid::new_v4()),
            connection_id: Set(connection_id),
            provider: Set(provider.to_string()),
            topic: Set(topic.to_string()),
            external_id: Set(external_id.to_string()),
            status: Set(STATUS_RECEIVED.to_string()),
            error: Set(None),
            records_written: Set(0),
            received_at: Set(Utc::now().fixed_offset()),
            processed_at: Set(None),
        };
        Ok(receipt.insert(&*self.db).await?)
    }

    /// An earlier delivery of the same external id that completed successfully. Failed and
    /// in-flight receipts do not count, so provider retries of a failed delivery go through.
    pub async fn find_completed(
        &self,
        connection_id: Uuid,
        provider: &str,
        external_id: &str,
    ) -> Result<Option<webhook_receipt::Model>> {
        Ok(WebhookReceipt::find()
            .filter(Column::ConnectionId.eq(connection_id))
            .filter(Column::Provider.eq(provider))
            .filter(Column::ExternalId.eq(external_id))
            .filter(Column::Status.eq(STATUS_PROCESSED))
            .order_by_desc(Column::ReceivedAt)
            .one(&*self.db)
            .await?)
    }

    /// Stamps the receipt's single completion update.
    pub async fn complete(
        &self,
        id: Uuid,
        outcome: ReceiptOutcome,
        error: Option<&str>,
    ) -> Result<webhook_receipt::Model> {
        let receipt = WebhookReceipt::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| anyhow!("webhook receipt {} not found", id))?;

        let mut active = receipt.into_active_model();
        active.status = Set(outcome.status().to_string());
        active.records_written = Set(i32::try_from(outcome.records_written()).unwrap_or(i32::MAX));
        active.error = Set(error.map(str::to_string));
        active.processed_at = Set(Some(Utc::now().fixed_offset()));
        Ok(active.update(&*self.db).await?)
    }

    pub async fn list_for_connection(&self, connection_id: Uuid) -> Result<Vec<webhook_receipt::Model>> {
        Ok(WebhookReceipt::find()
            .filter(Column::ConnectionId.eq(connection_id))
            .order_by_asc(Column::ReceivedAt)
            .all(&*self.db)
            .await?)
    }
}
