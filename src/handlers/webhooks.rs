//! # Webhook Handlers
//!
//! Public endpoints that receive Shopify and Stripe deliveries. Authentication is the
//! provider signature over the raw body; everything past routing is the orchestrator's
//! single-record ingestion path.

use axum::{
    body::Bytes,
    extract::{Path, Query, State, rejection::BytesRejection},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use utoipa::{IntoParams, ToSchema};

use crate::connectors::Provider;
use crate::error::{ApiError, IngestError};
use crate::handlers::{parse_id, parse_provider};
use crate::server::AppState;
use crate::sync_orchestrator::{WebhookOutcome, WebhookStatus, WebhookTarget};

/// How a provider-level webhook names its connection
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct WebhookTargetQuery {
    /// Connection UUID
    pub connection_id: Option<String>,
    /// Organization UUID; its active connection for the provider receives the event
    pub organization_id: Option<String>,
}

/// Verification challenge echoed by the GET endpoints
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ChallengeQuery {
    pub challenge: Option<String>,
}

/// Liveness body for webhook GETs without a challenge
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WebhookLiveness {
    pub status: String,
    pub provider: Provider,
}

fn resolve_target(query: &WebhookTargetQuery) -> Result<WebhookTarget, ApiError> {
    if let Some(raw) = query.connection_id.as_deref() {
        return Ok(WebhookTarget::Connection(parse_id(raw, "connection")?));
    }
    if let Some(raw) = query.organization_id.as_deref() {
        return Ok(WebhookTarget::Organization(parse_id(raw, "organization")?));
    }
    Ok(WebhookTarget::FromDelivery)
}

async fn ingest(
    state: &AppState,
    provider: Provider,
    target: WebhookTarget,
    headers: &HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<WebhookOutcome>, ApiError> {
    let result = match body {
        Ok(body) => {
            state
                .orchestrator
                .ingest_webhook(provider, target, headers, &body)
                .await
        }
        Err(rejection) => Err(IngestError::PayloadMalformed(format!(
            "unreadable body: {}",
            rejection.body_text()
        ))),
    };

    let outcome = match &result {
        Ok(outcome) => match outcome.status {
            WebhookStatus::Processed => "processed",
            WebhookStatus::Duplicate => "duplicate",
            WebhookStatus::Ignored => "ignored",
        },
        Err(err) => err.code(),
    };
    counter!("webhook_requests_total", "provider" => provider.as_str(), "outcome" => outcome)
        .increment(1);

    match result {
        Ok(outcome) => {
            info!(
                provider = %provider,
                connection_id = %outcome.connection_id,
                kind = %outcome.kind,
                status = ?outcome.status,
                records_written = outcome.records_written,
                "webhook accepted"
            );
            Ok(Json(outcome))
        }
        Err(err) => {
            if !matches!(err, IngestError::SignatureInvalid { .. }) {
                warn!(provider = %provider, code = err.code(), error = %err, "webhook rejected");
            }
            Err(err.into())
        }
    }
}

/// Receive a provider webhook routed by query parameter or by the delivery itself
#[utoipa::path(
    post,
    path = "/webhooks/{provider}",
    params(
        ("provider" = String, Path, description = "Provider slug", example = "stripe"),
        WebhookTargetQuery
    ),
    request_body(content = String, content_type = "application/json", description = "Raw provider payload"),
    responses(
        (status = 200, description = "Processed, duplicate, or ignored", body = WebhookOutcome),
        (status = 400, description = "Malformed payload", body = ApiError),
        (status = 401, description = "Signature verification failed", body = ApiError),
        (status = 404, description = "No active connection matches", body = ApiError),
        (status = 429, description = "Per-connection webhook rate limit exceeded", body = ApiError),
        (status = 500, description = "Internal failure; the provider should redeliver", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<WebhookTargetQuery>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<WebhookOutcome>, ApiError> {
    let provider = parse_provider(&provider)?;
    let target = resolve_target(&query)?;
    ingest(&state, provider, target, &headers, body).await
}

/// Receive a provider webhook for one connection
#[utoipa::path(
    post,
    path = "/webhooks/{provider}/{connection_id}",
    params(
        ("provider" = String, Path, description = "Provider slug", example = "shopify"),
        ("connection_id" = String, Path, description = "Connection UUID")
    ),
    request_body(content = String, content_type = "application/json", description = "Raw provider payload"),
    responses(
        (status = 200, description = "Processed, duplicate, or ignored", body = WebhookOutcome),
        (status = 400, description = "Malformed payload", body = ApiError),
        (status = 401, description = "Signature verification failed", body = ApiError),
        (status = 404, description = "No active connection matches", body = ApiError),
        (status = 429, description = "Per-connection webhook rate limit exceeded", body = ApiError),
        (status = 500, description = "Internal failure; the provider should redeliver", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn receive_connection_webhook(
    State(state): State<AppState>,
    Path((provider, connection_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<WebhookOutcome>, ApiError> {
    let provider = parse_provider(&provider)?;
    let connection_id = parse_id(&connection_id, "connection")?;
    ingest(
        &state,
        provider,
        WebhookTarget::Connection(connection_id),
        &headers,
        body,
    )
    .await
}

fn challenge_response(provider: Provider, query: ChallengeQuery) -> Response {
    match query.challenge {
        Some(challenge) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            challenge,
        )
            .into_response(),
        None => Json(WebhookLiveness {
            status: "ok".to_string(),
            provider,
        })
        .into_response(),
    }
}

/// Echo a verification challenge, or report liveness
#[utoipa::path(
    get,
    path = "/webhooks/{provider}",
    params(
        ("provider" = String, Path, description = "Provider slug"),
        ChallengeQuery
    ),
    responses(
        (status = 200, description = "Challenge echoed as text/plain, or a liveness body", body = WebhookLiveness),
        (status = 404, description = "Unknown provider", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn webhook_challenge(
    Path(provider): Path<String>,
    Query(query): Query<ChallengeQuery>,
) -> Result<Response, ApiError> {
    Ok(challenge_response(parse_provider(&provider)?, query))
}

/// Echo a verification challenge, or report liveness
#[utoipa::path(
    get,
    path = "/webhooks/{provider}/{connection_id}",
    params(
        ("provider" = String, Path, description = "Provider slug"),
        ("connection_id" = String, Path, description = "Connection UUID"),
        ChallengeQuery
    ),
    responses(
        (status = 200, description = "Challenge echoed as text/plain, or a liveness body", body = WebhookLiveness),
        (status = 404, description = "Unknown provider", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn connection_webhook_challenge(
    Path((provider, _connection_id)): Path<(String, String)>,
    Query(query): Query<ChallengeQuery>,
) -> Result<Response, ApiError> {
    Ok(challenge_response(parse_provider(&provider)?, query))
}
