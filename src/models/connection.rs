//! Connection entity model
//!
//! A connection links one organization to one provider account (a Shopify shop or a
//! Stripe account). Credentials are stored encrypted; disconnecting clears them.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Lifecycle status stored in `connections.status`.
pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_ERROR: &str = "error";
pub const STATUS_DISCONNECTED: &str = "disconnected";

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "connections")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owning organization
    pub organization_id: Uuid,

    /// Provider slug (`shopify` or `stripe`)
    pub provider: String,

    /// Shop domain for Shopify, account id for Stripe
    pub provider_account_id: String,

    /// AES-GCM sealed access credential; `None` once disconnected
    pub credential_ciphertext: Option<Vec<u8>>,

    /// active | error | disconnected
    pub status: String,

    /// Consecutive transient connection-test failures
    pub consecutive_failures: i32,

    pub last_error: Option<String>,

    pub last_synced_at: Option<DateTimeWithTimeZone>,

    /// Opaque cursor of the most recent completed backfill
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub last_cursor: Option<JsonValue>,

    /// Per-connection overrides (lookback days, entity selection)
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub settings: Option<JsonValue>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    pub fn is_active(&self) -> bool {
        self.status == STATUS_ACTIVE
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::metric_record::Entity")]
    MetricRecords,
    #[sea_orm(has_many = "super::sync_cursor::Entity")]
    SyncCursors,
}

impl Related<super::metric_record::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::MetricRecords.def()
    }
}

impl Related<super::sync_cursor::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SyncCursors.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
