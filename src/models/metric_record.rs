//! Metric record entity model
//!
//! One canonical business fact (revenue, an order, a new customer...) derived from a
//! provider event. Unique on `(connection_id, source_event_id, metric_type)`.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "metric_records")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub connection_id: Uuid,

    /// revenue | orders | customers | refunds | subscription_events | sessions
    pub metric_type: String,

    /// Amount in major currency units for monetary metrics, a count otherwise
    #[sea_orm(column_type = "Double")]
    pub value: f64,

    /// ISO-4217 code, upper case; `None` for count metrics
    pub currency: Option<String>,

    /// Provider slug the fact came from
    pub source: String,

    /// Deterministic identifier of the upstream fact
    pub source_event_id: String,

    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: JsonValue,

    pub occurred_at: DateTimeWithTimeZone,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::connection::Entity",
        from = "Column::ConnectionId",
        to = "super::connection::Column::Id",
        on_delete = "Cascade"
    )]
    Connection,
}

impl Related<super::connection::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Connection.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
