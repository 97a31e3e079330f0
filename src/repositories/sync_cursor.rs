//! Sync cursor repository
//!
//! Backfill position per `(connection_id, entity_type)`. The orchestrator saves a position
//! only after the page before it is written, and clears it when the entity finishes.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::connectors::Cursor;
use crate::models::sync_cursor::{self, Column, Entity as SyncCursor};

#[derive(Debug, Clone)]
pub struct SyncCursorRepository {
    db: Arc<DatabaseConnection>,
}

impl SyncCursorRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn get(&self, connection_id: Uuid, entity_type: &str) -> Result<Option<sync_cursor::Model>> {
        Ok(SyncCursor::find()
            .filter(Column::ConnectionId.eq(connection_id))
            .filter(Column::EntityType.eq(entity_type))
            .one(&*self.db)
            .await?)
    }

    pub async fn list(&self, connection_id: Uuid) -> Result<Vec<sync_cursor::Model>> {
        Ok(SyncCursor::find()
            .filter(Column::ConnectionId.eq(connection_id))
            .order_by_asc(Column::EntityType)
            .all(&*self.db)
            .await?)
    }

    /// Records that every page before `position` is durable. `window_start` pins the lower
    /// bound so a resumed backfill pages the same window.
    pub async fn save_position(
        &self,
        connection_id: Uuid,
        entity_type: &str,
        position: Option<&Cursor>,
        window_start: DateTime<Utc>,
    ) -> Result<sync_cursor::Model> {
        let position = position.map(|cursor| cursor.as_json().clone());
        let now = Utc::now().fixed_offset();

        match self.get(connection_id, entity_type).await? {
            Some(existing) => {
                let mut active = existing.into_active_model();
                active.position = Set(position);
                active.window_start = Set(Some(window_start.fixed_offset()));
                active.updated_at = Set(now);
                Ok(active.update(&*self.db).await?)
            }
            None => Ok(sync_cursor::ActiveModel {
                id: Set(Uuid::new_v4()),
                connection_id: Set(connection_id),
                entity_type: Set(entity_type.to_string()),
                position: Set(position),
                window_start: Set(Some(window_start.fixed_offset())),
                synced_until: Set(None),
                updated_at: Set(now),
            }
            .insert(&*self.db)
            .await?),
        }
    }

    /// Marks the entity fully synced up to `synced_until`, clearing the in-flight position.
    pub async fn complete(
        &self,
        connection_id: Uuid,
        entity_type: &str,
        synced_until: DateTime<Utc>,
    ) -> Result<sync_cursor::Model> {
        let now = Utc::now().fixed_offset();
        match self.get(connection_id, entity_type).await? {
            Some(existing) => {
                let mut active = existing.into_active_model();
                active.position = Set(None);
                active.window_start = Set(None);
                active.synced_until = Set(Some(synced_until.fixed_offset()));
                active.updated_at = Set(now);
                Ok(active.update(&*self.db).await?)
            }
            None => Ok(sync_cursor::ActiveModel {
                id: Set(Uuid::new_v4()),
                connection_id: Set(connection_id),
                entity_type: Set(entity_type.to_string()),
                position: Set(None),
                window_start: Set(None),
                synced_until: Set(Some(synced_until.fixed_offset())),
                updated_at: Set(now),
            }
            .insert(&*self.db)
            .await?),
        }
    }
}

/// Where an entity's next backfill starts: the stored position and window when a previous
/// run stopped mid-window, otherwise a fresh window from the last completed sync.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    pub since: DateTime<Utc>,
    pub position: Option<Cursor>,
}

impl ResumePoint {
    pub fn from_model(model: Option<&sync_cursor::Model>, default_since: DateTime<Utc>) -> Self {
        let Some(model) = model else {
            return Self {
                since: default_since,
                position: None,
            };
        };

        match (&model.position, model.window_start) {
            (Some(position), Some(window_start)) => Self {
                since: window_start.with_timezone(&Utc),
                position: Some(Cursor::from(position.clone())),
            },
            _ => Self {
                since: model
                    .synced_until
                    .map(|at| at.with_timezone(&Utc))
                    .unwrap_or(default_since),
                position: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::models::connection;
    use chrono::Duration;
    use serde_json::json;

    async fn setup() -> (SyncCursorRepository, Uuid) {
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
        (SyncCursorRepository::new(Arc::new(db)), connection_id)
    }

    #[tokio::test]
    async fn position_round_trips_and_completion_clears_it() {
        let (repo, connection_id) = setup().await;
        let window_start = Utc::now() - Duration::days(30);

        repo.save_position(connection_id, "orders", Some(&Cursor(json!(450))), window_start)
            .await
            .unwrap();
        let saved = repo.get(connection_id, "orders").await.unwrap();
        let resume = ResumePoint::from_model(saved.as_ref(), Utc::now());
        assert_eq!(resume.position, Some(Cursor(json!(450))));
        assert_eq!(resume.since.timestamp(), window_start.timestamp());

        let until = Utc::now();
        repo.complete(connection_id, "orders", until).await.unwrap();
        let done = repo.get(connection_id, "orders").await.unwrap();
        let resume = ResumePoint::from_model(done.as_ref(), window_start);
        assert_eq!(resume.position, None);
        assert_eq!(resume.since.timestamp(), until.timestamp());

        assert_eq!(repo.list(connection_id).await.unwrap().len(), 1);
    }

    #[test]
    fn missing_cursor_uses_default_window() {
        let default_since = Utc::now() - Duration::days(30);
        let resume = ResumePoint::from_model(None, default_since);
        assert_eq!(resume.since, default_since);
        assert!(resume.position.is_none());
    }
}
