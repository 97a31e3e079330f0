//! # API Handlers
//!
//! HTTP endpoint handlers for webhooks, connections, and sync tasks.

pub mod connections;
pub mod sync;
pub mod webhooks;

use axum::{extract::State, http::StatusCode, response::Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::connectors::Provider;
use crate::db;
use crate::error::{ApiError, IngestError};
use crate::models::ServiceInfo;
use crate::server::AppState;

/// Root handler that returns basic service information
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service information", body = ServiceInfo)
    ),
    tag = "root"
)]
pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo::default())
}

/// Liveness payload
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// `ok` when the database answered
    pub status: String,
    pub database: String,
}

/// Liveness check including a database ping
#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, description = "Service and database are reachable", body = HealthResponse),
        (status = 503, description = "Database unreachable", body = ApiError)
    ),
    tag = "root"
)]
pub async fn healthz(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    db::health_check(&state.db).await.map_err(|err| {
        tracing::error!(error = %err, "health check failed");
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVICE_UNAVAILABLE",
            "Database unreachable",
        )
    })?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        database: "ok".to_string(),
    }))
}

/// Path segments name providers by slug; anything else is simply not a route we serve.
pub(crate) fn parse_provider(slug: &str) -> Result<Provider, ApiError> {
    slug.parse::<Provider>()
        .map_err(|_| IngestError::ConnectionNotFound(format!("unknown provider '{slug}'")).into())
}

/// Ids arrive as strings so malformed ones answer problem+json rather than a bare rejection.
pub(crate) fn parse_id(raw: &str, what: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim()).map_err(|_| crate::error::not_found(&format!("{what} '{raw}' not found")))
}
