//! # Connections API Handlers
//!
//! Manual connection creation, status reads, connection tests, disconnect, and the
//! read-only metric listing.

use axum::{
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::connectors::Provider;
use crate::connectors::shopify::normalize_shop_domain;
use crate::cursor::{decode_cursor, encode_cursor};
use crate::error::{ApiError, IngestError, validation_error};
use crate::handlers::parse_id;
use crate::models::{connection, metric_record};
use crate::normalization::MetricType;
use crate::repositories::{ConnectionSyncSettings, CreateConnectionError, NewConnection};
use crate::server::AppState;
use crate::sync_orchestrator::{ConnectionTestReport, SyncPhase};
use crate::sync_tasks::SyncTask;

const DEFAULT_METRICS_LIMIT: u64 = 50;
const MAX_METRICS_LIMIT: u64 = 200;

/// Manual credential entry for a connection
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct CreateConnectionRequest {
    pub organization_id: Uuid,
    /// `shopify` or `stripe`
    #[schema(example = "shopify")]
    pub provider: String,
    /// Shop domain for Shopify, account id for Stripe
    #[schema(example = "acme.myshopify.com")]
    pub provider_account_id: String,
    /// Admin API access token or secret key; encrypted at rest, never returned
    pub credential: String,
    /// Optional sync overrides, e.g. `{"sync": {"lookback_days": 90}}`
    pub settings: Option<JsonValue>,
}

/// Connection status and in-memory sync state
#[derive(Debug, Serialize, ToSchema)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub provider: String,
    pub provider_account_id: String,
    /// active | error | disconnected
    pub status: String,
    pub consecutive_failures: i32,
    pub last_error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Whether an encrypted credential is stored
    pub has_credential: bool,
    pub settings: Option<JsonValue>,
    pub sync_phase: SyncPhase,
    /// Most recent sync task, while it is still in the task registry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_task: Option<SyncTask>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConnectionInfo {
    fn build(state: &AppState, model: connection::Model) -> Self {
        let sync_phase = state.orchestrator.sync_phase(&model);
        let latest_task = state.orchestrator.tasks().latest_for_connection(model.id);
        Self {
            id: model.id,
            organization_id: model.organization_id,
            provider: model.provider,
            provider_account_id: model.provider_account_id,
            status: model.status,
            consecutive_failures: model.consecutive_failures,
            last_error: model.last_error,
            last_synced_at: model.last_synced_at.map(|at| at.with_timezone(&Utc)),
            has_credential: model.credential_ciphertext.is_some(),
            settings: model.settings,
            sync_phase,
            latest_task,
            created_at: model.created_at.with_timezone(&Utc),
            updated_at: model.updated_at.with_timezone(&Utc),
        }
    }
}

/// One metric record
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MetricRecordInfo {
    pub id: Uuid,
    #[schema(example = "revenue")]
    pub metric_type: String,
    pub value: f64,
    pub currency: Option<String>,
    pub source: String,
    pub source_event_id: String,
    pub metadata: JsonValue,
    pub occurred_at: DateTime<Utc>,
}

impl From<metric_record::Model> for MetricRecordInfo {
    fn from(model: metric_record::Model) -> Self {
        Self {
            id: model.id,
            metric_type: model.metric_type,
            value: model.value,
            currency: model.currency,
            source: model.source,
            source_event_id: model.source_event_id,
            metadata: model.metadata,
            occurred_at: model.occurred_at.with_timezone(&Utc),
        }
    }
}

/// A page of metric records
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MetricsPage {
    pub data: Vec<MetricRecordInfo>,
    /// Opaque cursor for the next page (null on the last page)
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListMetricsQuery {
    /// revenue | orders | customers | refunds | subscription_events | sessions
    pub metric_type: Option<String>,
    /// Page size (default 50, max 200)
    pub limit: Option<u64>,
    /// Opaque cursor from a previous page
    pub cursor: Option<String>,
}

pub(crate) async fn load_connection(state: &AppState, id: Uuid) -> Result<connection::Model, ApiError> {
    state
        .orchestrator
        .connections()
        .get_by_id(id)
        .await?
        .ok_or_else(|| IngestError::ConnectionNotFound(id.to_string()).into())
}

/// Create a connection from manually entered credentials
#[utoipa::path(
    post,
    path = "/connections",
    request_body = CreateConnectionRequest,
    responses(
        (status = 201, description = "Connection created", body = ConnectionInfo),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 409, description = "Organization already has an active connection for the provider", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn create_connection(
    State(state): State<AppState>,
    payload: Result<Json<CreateConnectionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ConnectionInfo>), ApiError> {
    let Json(request) = payload?;
    let mut field_errors = serde_json::Map::new();
    let provider = request.provider.parse::<Provider>();
    if provider.is_err() {
        field_errors.insert("provider".into(), json!("must be one of: shopify, stripe"));
    }
    if request.provider_account_id.trim().is_empty() {
        field_errors.insert("provider_account_id".into(), json!("must not be empty"));
    }
    if request.credential.trim().is_empty() {
        field_errors.insert("credential".into(), json!("must not be empty"));
    }
    if request.settings.as_ref().is_some_and(|s| !s.is_object()) {
        field_errors.insert("settings".into(), json!("must be a JSON object"));
    }
    let provider = match provider {
        Ok(provider) if field_errors.is_empty() => provider,
        _ => {
            return Err(validation_error(
                "invalid connection request",
                JsonValue::Object(field_errors),
            ));
        }
    };

    let account = match provider {
        Provider::Shopify => normalize_shop_domain(&request.provider_account_id),
        Provider::Stripe => request.provider_account_id.trim().to_string(),
    };
    let settings = request.settings.map(|raw| {
        ConnectionSyncSettings::from_connection_settings(Some(&raw)).into_connection_settings(Some(&raw))
    });

    let model = state
        .orchestrator
        .connections()
        .create(NewConnection {
            organization_id: request.organization_id,
            provider,
            provider_account_id: &account,
            credential: request.credential.trim(),
            settings,
        })
        .await
        .map_err(|err| match err {
            CreateConnectionError::ActiveExists { .. } => {
                ApiError::new(StatusCode::CONFLICT, "CONFLICT", &err.to_string())
            }
            CreateConnectionError::Crypto(inner) => IngestError::Internal(inner.into()).into(),
            CreateConnectionError::Database(inner) => inner.into(),
        })?;

    Ok((StatusCode::CREATED, Json(ConnectionInfo::build(&state, model))))
}

/// Connection status including in-memory sync state
#[utoipa::path(
    get,
    path = "/connections/{id}",
    params(("id" = String, Path, description = "Connection UUID")),
    responses(
        (status = 200, description = "Connection", body = ConnectionInfo),
        (status = 404, description = "Not found", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn get_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConnectionInfo>, ApiError> {
    let model = load_connection(&state, parse_id(&id, "connection")?).await?;
    Ok(Json(ConnectionInfo::build(&state, model)))
}

/// Run one lightweight authenticated call against the provider
#[utoipa::path(
    post,
    path = "/connections/{id}/test",
    params(("id" = String, Path, description = "Connection UUID")),
    responses(
        (status = 200, description = "Test result; `success` tells whether the provider accepted the credential", body = ConnectionTestReport),
        (status = 404, description = "Not found or disconnected", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn test_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConnectionTestReport>, ApiError> {
    let id = parse_id(&id, "connection")?;
    Ok(Json(state.orchestrator.test_connection(id).await?))
}

/// Disconnect: abort any backfill, drop the queue, discard the credential
#[utoipa::path(
    post,
    path = "/connections/{id}/disconnect",
    params(("id" = String, Path, description = "Connection UUID")),
    responses(
        (status = 200, description = "Connection disconnected", body = ConnectionInfo),
        (status = 404, description = "Not found", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn disconnect_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConnectionInfo>, ApiError> {
    let id = parse_id(&id, "connection")?;
    let model = state.orchestrator.disconnect(id, "disconnected by operator").await?;
    Ok(Json(ConnectionInfo::build(&state, model)))
}

/// Metric records for a connection, newest first
#[utoipa::path(
    get,
    path = "/connections/{id}/metrics",
    params(("id" = String, Path, description = "Connection UUID"), ListMetricsQuery),
    responses(
        (status = 200, description = "Page of metric records", body = MetricsPage),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 404, description = "Not found", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn list_metrics(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ListMetricsQuery>,
) -> Result<Json<MetricsPage>, ApiError> {
    let connection = load_connection(&state, parse_id(&id, "connection")?).await?;

    let limit = query.limit.unwrap_or(DEFAULT_METRICS_LIMIT);
    if !(1..=MAX_METRICS_LIMIT).contains(&limit) {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_FAILED",
            "limit must be between 1 and 200",
        ));
    }
    let metric_type = query
        .metric_type
        .as_deref()
        .map(str::parse::<MetricType>)
        .transpose()
        .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", &err.to_string()))?;
    let cursor = query.cursor.as_deref().map(decode_cursor).transpose()?;

    // One extra row tells whether another page exists.
    let mut rows = state
        .orchestrator
        .writer()
        .list(connection.id, metric_type, cursor, limit + 1)
        .await?;
    let has_more = rows.len() as u64 > limit;
    rows.truncate(limit as usize);

    let next_cursor = match rows.last() {
        Some(last) if has_more => Some(
            encode_cursor(last.occurred_at.with_timezone(&Utc), last.id)
                .map_err(|err| IngestError::Internal(err.into()))?,
        ),
        _ => None,
    };

    Ok(Json(MetricsPage {
        data: rows.into_iter().map(MetricRecordInfo::from).collect(),
        next_cursor,
        has_more,
    }))
}
