//! Sync cursor entity model
//!
//! Backfill progress per `(connection_id, entity_type)`. `position` only advances after
//! the page it points past has been durably written.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_cursors")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub connection_id: Uuid,

    /// Provider entity being paged, e.g. `orders` or `charges`
    pub entity_type: String,

    /// Opaque provider cursor; `None` means start from the beginning of the window
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub position: Option<JsonValue>,

    /// Lower bound of the in-flight backfill window
    pub window_start: Option<DateTimeWithTimeZone>,

    /// Upper bound of the last completed backfill
    pub synced_until: Option<DateTimeWithTimeZone>,

    pub updated_at: DateTimeWithTimeZone,
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
