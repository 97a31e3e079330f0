//! Connection repository for database operations
//!
//! Encapsulates SeaORM access to the `connections` table: creation with a sealed credential,
//! lookups used by webhook routing, and the status transitions driven by connection tests,
//! syncs, and disconnects.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, Set,
};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::connectors::Provider;
use crate::crypto::{CryptoError, CryptoKey, open_credential, seal_credential};
use crate::error::is_unique_violation;
use crate::models::connection::{
    self, Entity as Connection, STATUS_ACTIVE, STATUS_DISCONNECTED, STATUS_ERROR,
};

/// Input for [`ConnectionRepository::create`].
#[derive(Debug)]
pub struct NewConnection<'a> {
    pub organization_id: Uuid,
    pub provider: Provider,
    pub provider_account_id: &'a str,
    pub credential: &'a str,
    pub settings: Option<JsonValue>,
}

#[derive(Debug, Error)]
pub enum CreateConnectionError {
    #[error("organization {organization_id} already has an active {provider} connection")]
    ActiveExists {
        organization_id: Uuid,
        provider: Provider,
    },
    #[error("credential encryption failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Database(#[from] sea_orm::DbErr),
}

/// Outcome of recording a failed connection test.
#[derive(Debug, Clone)]
pub struct FailureOutcome {
    pub connection: connection::Model,
    /// True when this failure moved the connection into `error`.
    pub flipped_to_error: bool,
}

/// Repository for connection database operations
#[derive(Debug, Clone)]
pub struct ConnectionRepository {
    db: Arc<DatabaseConnection>,
    crypto_key: CryptoKey,
}

impl ConnectionRepository {
    pub fn new(db: Arc<DatabaseConnection>, crypto_key: CryptoKey) -> Self {
        Self { db, crypto_key }
    }

    /// Creates an active connection with its credential sealed at rest.
    pub async fn create(
        &self,
        input: NewConnection<'_>,
    ) -> std::result::Result<connection::Model, CreateConnectionError> {
        let provider = input.provider.as_str();
        let account = input.provider_account_id.trim();

        let existing = Connection::find()
            .filter(connection::Column::OrganizationId.eq(input.organization_id))
            .filter(connection::Column::Provider.eq(provider))
            .filter(connection::Column::Status.eq(STATUS_ACTIVE))
            .one(&*self.db)
            .await?;
        if existing.is_some() {
            return Err(CreateConnectionError::ActiveExists {
                organization_id: input.organization_id,
                provider: input.provider,
            });
        }

        let sealed = seal_credential(
            &self.crypto_key,
            input.organization_id,
            provider,
            account,
            input.credential,
        )?;

        let now = Utc::now().fixed_offset();
        let active = connection::ActiveModel {
            id: Set(Uuid::new_v4()),
            organization_id: Set(input.organization_id),
            provider: Set(provider.to_string()),
            provider_account_id: Set(account.to_string()),
            credential_ciphertext: Set(Some(sealed)),
            status: Set(STATUS_ACTIVE.to_string()),
            consecutive_failures: Set(0),
            last_error: Set(None),
            last_synced_at: Set(None),
            last_cursor: Set(None),
            settings: Set(input.settings),
            created_at: Set(now),
            updated_at: Set(now),
        };

        // The partial unique index settles races between concurrent creates.
        match active.insert(&*self.db).await {
            Ok(model) => {
                tracing::info!(
                    connection_id = %model.id,
                    organization_id = %model.organization_id,
                    provider = %model.provider,
                    "connection created"
                );
                Ok(model)
            }
            Err(err) if is_unique_violation(&err) => Err(CreateConnectionError::ActiveExists {
                organization_id: input.organization_id,
                provider: input.provider,
            }),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<connection::Model>> {
        Ok(Connection::find_by_id(id).one(&*self.db).await?)
    }

    /// The active connection an organization holds for `provider`, if any.
    pub async fn find_active_by_org_provider(
        &self,
        organization_id: Uuid,
        provider: Provider,
    ) -> Result<Option<connection::Model>> {
        Ok(Connection::find()
            .filter(connection::Column::OrganizationId.eq(organization_id))
            .filter(connection::Column::Provider.eq(provider.as_str()))
            .filter(connection::Column::Status.eq(STATUS_ACTIVE))
            .one(&*self.db)
            .await?)
    }

    /// Most recent non-disconnected connection for a provider account (shop domain or
    /// Stripe account id).
    pub async fn find_by_provider_account(
        &self,
        provider: Provider,
        provider_account_id: &str,
    ) -> Result<Option<connection::Model>> {
        Ok(Connection::find()
            .filter(connection::Column::Provider.eq(provider.as_str()))
            .filter(connection::Column::ProviderAccountId.eq(provider_account_id))
            .filter(connection::Column::Status.ne(STATUS_DISCONNECTED))
            .order_by_desc(connection::Column::CreatedAt)
            .one(&*self.db)
            .await?)
    }

    /// All active connections, oldest sync first.
    pub async fn list_active(&self) -> Result<Vec<connection::Model>> {
        Ok(Connection::find()
            .filter(connection::Column::Status.eq(STATUS_ACTIVE))
            .order_by_asc(connection::Column::LastSyncedAt)
            .order_by_asc(connection::Column::Id)
            .all(&*self.db)
            .await?)
    }

    /// Decrypts the stored credential. Failures are logged without detail.
    pub fn credential(&self, connection: &connection::Model) -> Result<Zeroizing<String>> {
        open_credential(&self.crypto_key, connection).map_err(|e| {
            tracing::error!(
                connection_id = %connection.id,
                provider = %connection.provider,
                "credential decryption failed"
            );
            anyhow!("credential unavailable: {}", e)
        })
    }

    /// A passing connection test resets the failure streak and reactivates an `error`
    /// connection. Disconnected connections stay disconnected.
    pub async fn record_test_success(&self, id: Uuid) -> Result<connection::Model> {
        let model = self.require(id).await?;
        if model.status == STATUS_DISCONNECTED {
            return Ok(model);
        }

        let mut active = model.into_active_model();
        active.status = Set(STATUS_ACTIVE.to_string());
        active.consecutive_failures = Set(0);
        active.last_error = Set(None);
        active.updated_at = Set(Utc::now().fixed_offset());
        Ok(active.update(&*self.db).await?)
    }

    /// Counts a failed connection test. The connection flips to `error` once the streak
    /// reaches `threshold`, or straight away when `immediate` (the provider rejected the
    /// credential).
    pub async fn record_test_failure(
        &self,
        id: Uuid,
        error: &str,
        threshold: u32,
        immediate: bool,
    ) -> Result<FailureOutcome> {
        let model = self.require(id).await?;
        if model.status == STATUS_DISCONNECTED {
            return Ok(FailureOutcome {
                connection: model,
                flipped_to_error: false,
            });
        }

        let failures = model.consecutive_failures.saturating_add(1);
        let reached = immediate || failures as u32 >= threshold.max(1);
        let flipped_to_error = reached && model.status != STATUS_ERROR;

        let mut active = model.into_active_model();
        active.consecutive_failures = Set(failures);
        active.last_error = Set(Some(error.to_string()));
        if reached {
            active.status = Set(STATUS_ERROR.to_string());
        }
        active.updated_at = Set(Utc::now().fixed_offset());
        let connection = active.update(&*self.db).await?;

        if flipped_to_error {
            tracing::warn!(
                connection_id = %connection.id,
                provider = %connection.provider,
                consecutive_failures = failures,
                "connection moved to error"
            );
        }

        Ok(FailureOutcome {
            connection,
            flipped_to_error,
        })
    }

    /// Stamps a finished backfill.
    pub async fn mark_synced(
        &self,
        id: Uuid,
        synced_at: DateTime<Utc>,
        last_cursor: Option<JsonValue>,
    ) -> Result<connection::Model> {
        let mut active = self.require(id).await?.into_active_model();
        active.last_synced_at = Set(Some(synced_at.fixed_offset()));
        if last_cursor.is_some() {
            active.last_cursor = Set(last_cursor);
        }
        active.updated_at = Set(Utc::now().fixed_offset());
        Ok(active.update(&*self.db).await?)
    }

    pub async fn update_settings(&self, id: Uuid, settings: JsonValue) -> Result<connection::Model> {
        let mut active = self.require(id).await?.into_active_model();
        active.settings = Set(Some(settings));
        active.updated_at = Set(Utc::now().fixed_offset());
        Ok(active.update(&*self.db).await?)
    }

    /// Moves the connection to `disconnected` and discards its credential. Returns `None`
    /// when the connection does not exist; disconnecting twice is a no-op.
    pub async fn disconnect(&self, id: Uuid, reason: &str) -> Result<Option<connection::Model>> {
        let Some(model) = self.get_by_id(id).await? else {
            return Ok(None);
        };
        if model.status == STATUS_DISCONNECTED && model.credential_ciphertext.is_none() {
            return Ok(Some(model));
        }

        let mut active = model.into_active_model();
        active.status = Set(STATUS_DISCONNECTED.to_string());
        active.credential_ciphertext = Set(None);
        active.last_error = Set(Some(reason.to_string()));
        active.updated_at = Set(Utc::now().fixed_offset());
        let model = active.update(&*self.db).await?;

        tracing::info!(
            connection_id = %model.id,
            provider = %model.provider,
            reason,
            "connection disconnected"
        );
        Ok(Some(model))
    }

    async fn require(&self, id: Uuid) -> Result<connection::Model> {
        self.get_by_id(id)
            .await?
            .ok_or_else(|| anyhow!("Connection with ID '{}' not found", id))
    }
}
