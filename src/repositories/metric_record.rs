//! # Metric Record Repository
//!
//! The idempotent writer and the read-only listing behind the metrics endpoint.
//!
//! Every insert is keyed on `(connection_id, source_event_id, metric_type)`. A row that
//! already exists is skipped, whether the backend reports it through `ON CONFLICT DO NOTHING`
//! or a unique violation. Records in a batch are written independently so one failing row
//! never drops its siblings.

use anyhow::Result;
use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, IntoActiveModel,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::is_unique_violation;
use crate::models::metric_record::{self, Column, Entity as MetricRecord, Model};
use crate::normalization::{MetricDraft, MetricType};

/// Metadata keys scrubbed by a customer redaction request.
const PII_KEYS: &[&str] = &["email", "customer_id", "customer_name", "phone"];

const REDACTION_SCAN_BATCH: u64 = 500;

/// Cursor data structure for pagination
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CursorData {
    pub occurred_at: DateTime<Utc>,
    pub id: Uuid,
}

/// Result of one [`MetricWriter::write`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    /// Rows inserted by this call
    pub written: u64,
    /// Drafts whose idempotency key already existed
    pub skipped: u64,
    /// Drafts that failed for any other reason
    pub failed: u64,
}

impl WriteSummary {
    pub fn merge(&mut self, other: WriteSummary) {
        self.written += other.written;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }

    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Clone)]
pub struct MetricWriter {
    db: Arc<DatabaseConnection>,
}

impl MetricWriter {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Insert-or-skip every draft for `connection_id`.
    pub async fn write(&self, connection_id: Uuid, drafts: &[MetricDraft]) -> WriteSummary {
        let mut summary = WriteSummary::default();

        for draft in drafts {
            match self.insert_one(connection_id, draft).await {
                Ok(true) => {
                    summary.written += 1;
                    counter!("metric_records_written_total", "provider" => draft.source.clone())
                        .increment(1);
                }
                Ok(false) => {
                    summary.skipped += 1;
                    counter!("metric_records_skipped_total", "provider" => draft.source.clone())
                        .increment(1);
                }
                Err(err) => {
                    summary.failed += 1;
                    tracing::error!(
                        connection_id = %connection_id,
                        source_event_id = %draft.source_event_id,
                        metric_type = %draft.metric_type,
                        error = %err,
                        "failed to write metric record"
                    );
                }
            }
        }

        if summary.skipped > 0 {
            tracing::debug!(
                connection_id = %connection_id,
                skipped = summary.skipped,
                "duplicate metric records absorbed"
            );
        }
        summary
    }

    /// `Ok(true)` when a row was inserted, `Ok(false)` when the key already existed.
    async fn insert_one(&self, connection_id: Uuid, draft: &MetricDraft) -> Result<bool, sea_orm::DbErr> {
        let active = metric_record::ActiveModel {
            id: Set(Uuid::new_v4()),
            connection_id: Set(connection_id),
            metric_type: Set(draft.metric_type.as_str().to_string()),
            value: Set(draft.value),
            currency: Set(draft.currency.clone()),
            source: Set(draft.source.clone()),
            source_event_id: Set(draft.source_event_id.clone()),
            metadata: Set(draft.metadata.clone()),
            occurred_at: Set(draft.occurred_at.fixed_offset()),
            created_at: Set(Utc::now().fixed_offset()),
        };

        let result = MetricRecord::insert(active)
            .on_conflict(
                OnConflict::columns([Column::ConnectionId, Column::SourceEventId, Column::MetricType])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await;

        match result {
            Ok(rows) => Ok(rows > 0),
            Err(err) if is_unique_violation(&err) => Ok(false),
            Err(sea_orm::DbErr::RecordNotInserted) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Records for a connection ordered by `occurred_at DESC, id DESC`, starting after
    /// `cursor` when given.
    pub async fn list(
        &self,
        connection_id: Uuid,
        metric_type: Option<MetricType>,
        cursor: Option<CursorData>,
        limit: u64,
    ) -> Result<Vec<Model>> {
        let mut query = MetricRecord::find().filter(Column::ConnectionId.eq(connection_id));

        if let Some(metric_type) = metric_type {
            query = query.filter(Column::MetricType.eq(metric_type.as_str()));
        }

        if let Some(cursor) = cursor {
            let occurred_at = cursor.occurred_at.fixed_offset();
            query = query.filter(
                Condition::any()
                    .add(Column::OccurredAt.lt(occurred_at))
                    .add(
                        Condition::all()
                            .add(Column::OccurredAt.eq(occurred_at))
                            .add(Column::Id.lt(cursor.id)),
                    ),
            );
        }

        Ok(query
            .order_by_desc(Column::OccurredAt)
            .order_by_desc(Column::Id)
            .limit(limit)
            .all(&*self.db)
            .await?)
    }

    pub async fn count_for_connection(&self, connection_id: Uuid) -> Result<u64> {
        use sea_orm::PaginatorTrait;
        Ok(MetricRecord::find()
            .filter(Column::ConnectionId.eq(connection_id))
            .count(&*self.db)
            .await?)
    }

    /// Scrubs customer PII from the metadata of every record tied to `customer_id`.
    /// Values, timestamps, and idempotency keys are left intact. Returns the rows changed.
    pub async fn redact_customer(&self, connection_id: Uuid, customer_id: &str) -> Result<u64> {
        let mut redacted = 0u64;
        let mut after: Option<Uuid> = None;

        loop {
            let mut query = MetricRecord::find()
                .filter(Column::ConnectionId.eq(connection_id))
                .order_by_asc(Column::Id)
                .limit(REDACTION_SCAN_BATCH);
            if let Some(last) = after {
                query = query.filter(Column::Id.gt(last));
            }
            let batch = query.all(&*self.db).await?;
            let Some(last) = batch.last() else {
                break;
            };
            after = Some(last.id);
            let exhausted = (batch.len() as u64) < REDACTION_SCAN_BATCH;

            for record in batch {
                if !belongs_to_customer(&record.metadata, customer_id) {
                    continue;
                }
                let mut metadata = record.metadata.clone();
                if let Some(map) = metadata.as_object_mut() {
                    for key in PII_KEYS {
                        map.remove(*key);
                    }
                    map.insert("redacted".to_string(), JsonValue::Bool(true));
                }
                let mut active = record.into_active_model();
                active.metadata = Set(metadata);
                active.update(&*self.db).await?;
                redacted += 1;
            }

            if exhausted {
                break;
            }
        }

        tracing::info!(connection_id = %connection_id, redacted, "customer data redacted");
        Ok(redacted)
    }
}

fn belongs_to_customer(metadata: &JsonValue, customer_id: &str) -> bool {
    match metadata.get("customer_id") {
        Some(JsonValue::String(id)) => id == customer_id,
        Some(JsonValue::Number(id)) => id.to_string() == customer_id,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::Provider;
    use crate::db::test_db;
    use crate::models::connection;
    use chrono::Duration;
    use serde_json::json;

    async fn setup() -> (MetricWriter, Uuid) {
        let db = test_db().await;
        let connection_id = Uuid::new_v4();
        let now = Utc::now().fixed_offset();
        connection::ActiveModel {
            id: Set(connection_id),
            organization_id: Set(Uuid::new_v4()),
            provider: Set("shopify".to_string()),
            provider_account_id: Set("acme.myshopify.com".to_string()),
            credential_ciphertext: Set(None),
            status: Set("active".to_string()),
            consecutive_failures: Set(0),
            last_error: Set(None),
            last_synced_at: Set(None),
            last_cursor: Set(None),
            settings: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&db)
        .await
        .unwrap();
        (MetricWriter::new(Arc::new(db)), connection_id)
    }

    fn order(id: u64, at: DateTime<Utc>) -> Vec<MetricDraft> {
        let key = format!("shopify:order:{id}");
        vec![
            MetricDraft::count(Provider::Shopify, MetricType::Orders, key.clone(), at)
                .with_meta("customer_id", Some("42"))
                .with_meta("email", Some("ada@example.com")),
            MetricDraft::new(Provider::Shopify, MetricType::Revenue, 99.5, key, at)
                .with_currency("usd"),
        ]
    }

    #[tokio::test]
    async fn second_write_of_same_drafts_is_absorbed() {
        let (writer, connection_id) = setup().await;
        let drafts = order(1, Utc::now());

        let first = writer.write(connection_id, &drafts).await;
        assert_eq!(first, WriteSummary { written: 2, skipped: 0, failed: 0 });

        let second = writer.write(connection_id, &drafts).await;
        assert_eq!(second, WriteSummary { written: 0, skipped: 2, failed: 0 });
        assert_eq!(writer.count_for_connection(connection_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn duplicate_within_batch_keeps_siblings() {
        let (writer, connection_id) = setup().await;
        let at = Utc::now();
        let mut drafts = order(1, at);
        drafts.extend(order(1, at));
        drafts.extend(order(2, at));

        let summary = writer.write(connection_id, &drafts).await;
        assert_eq!(summary.written, 4);
        assert_eq!(summary.skipped, 2);
        assert!(summary.is_complete());
    }

    #[tokio::test]
    async fn listing_pages_by_occurred_at_desc() {
        let (writer, connection_id) = setup().await;
        let base = Utc::now();
        for i in 0..5 {
            writer
                .write(connection_id, &order(i, base - Duration::minutes(i as i64)))
                .await;
        }

        let first = writer
            .list(connection_id, Some(MetricType::Orders), None, 2)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        assert!(first[0].occurred_at >= first[1].occurred_at);

        let cursor = CursorData {
            occurred_at: first[1].occurred_at.with_timezone(&Utc),
            id: first[1].id,
        };
        let rest = writer
            .list(connection_id, Some(MetricType::Orders), Some(cursor), 10)
            .await
            .unwrap();
        assert_eq!(rest.len(), 3);
        assert!(rest.iter().all(|r| r.metric_type == "orders"));
        assert!(rest.iter().all(|r| !first.iter().any(|f| f.id == r.id)));
    }

    #[tokio::test]
    async fn redaction_scrubs_only_that_customers_pii() {
        let (writer, connection_id) = setup().await;
        let at = Utc::now();
        writer.write(connection_id, &order(1, at)).await;
        let other = MetricDraft::count(
            Provider::Shopify,
            MetricType::Customers,
            "shopify:customer:7".into(),
            at,
        )
        .with_meta("customer_id", Some("7"))
        .with_meta("email", Some("bob@example.com"));
        writer.write(connection_id, &[other]).await;

        let changed = writer.redact_customer(connection_id, "42").await.unwrap();
        assert_eq!(changed, 1);

        let records = writer.list(connection_id, None, None, 10).await.unwrap();
        let orders = records.iter().find(|r| r.metric_type == "orders").unwrap();
        assert!(orders.metadata.get("email").is_none());
        assert_eq!(orders.metadata["redacted"], json!(true));
        assert_eq!(orders.metadata["sourceEventId"], "shopify:order:1");

        let customer = records.iter().find(|r| r.metric_type == "customers").unwrap();
        assert_eq!(customer.metadata["email"], "bob@example.com");
    }
}
