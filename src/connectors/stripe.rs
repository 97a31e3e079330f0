//! Stripe adapter
//!
//! Secret-key bearer auth, `starting_after` cursor pagination over list endpoints, and
//! timestamped `Stripe-Signature` webhooks.

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::config::AppConfig;
use crate::connectors::trait_::{
    ConnectionAdapter, ConnectionContext, ConnectorError, Cursor, Page, PageRequest,
    WebhookEnvelope,
};
use crate::connectors::{AuthType, PaginationStyle, Provider, ProviderMetadata};
use crate::normalization::NormalizationError;
use crate::request_queue::OutboundRequest;
use crate::webhook_verification::{
    STRIPE_SIGNATURE_HEADER, VerificationError, VerificationResult, verify_stripe_signature,
};

const ENTITY_TYPES: &[&str] = &["charges", "refunds", "invoices", "customers"];

/// Stripe caps list pages at 100 objects.
const MAX_LIST_LIMIT: u32 = 100;

#[derive(Clone)]
pub struct StripeAdapter {
    webhook_secret: Option<String>,
    api_base: String,
    replay_tolerance_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    data: Vec<Value>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct EventHeader {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    account: Option<String>,
}

impl StripeAdapter {
    pub fn new(webhook_secret: Option<String>, api_base: String, replay_tolerance_seconds: u64) -> Self {
        Self {
            webhook_secret,
            api_base: api_base.trim_end_matches('/').to_string(),
            replay_tolerance_seconds,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.webhooks.stripe_secret.clone(),
            config.providers.stripe_api_base.clone(),
            config.webhooks.replay_tolerance_seconds,
        )
    }

    fn request(&self, ctx: &ConnectionContext, path: &str) -> OutboundRequest {
        OutboundRequest::get(format!("{}/v1/{path}", self.api_base)).bearer(ctx.credential())
    }
}

#[async_trait]
impl ConnectionAdapter for StripeAdapter {
    fn provider(&self) -> Provider {
        Provider::Stripe
    }

    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            provider: Provider::Stripe,
            auth_type: AuthType::SecretKey,
            pagination: PaginationStyle::Cursor,
            entity_types: ENTITY_TYPES.iter().map(|s| s.to_string()).collect(),
            signature_header: STRIPE_SIGNATURE_HEADER.to_string(),
        }
    }

    fn entity_types(&self) -> &'static [&'static str] {
        ENTITY_TYPES
    }

    fn pagination_style(&self) -> PaginationStyle {
        PaginationStyle::Cursor
    }

    fn verify_signature(&self, headers: &HeaderMap, body: &[u8], now_unix: i64) -> VerificationResult<()> {
        let signature = headers
            .get(STRIPE_SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| VerificationError::MissingSignature {
                header: STRIPE_SIGNATURE_HEADER.to_string(),
            })?;
        verify_stripe_signature(
            body,
            signature,
            self.webhook_secret.as_deref().unwrap_or(""),
            self.replay_tolerance_seconds,
            now_unix,
        )
    }

    fn parse_webhook(&self, _headers: &HeaderMap, body: &[u8]) -> Result<WebhookEnvelope, NormalizationError> {
        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| NormalizationError::malformed("stripe webhook", e))?;
        let header = EventHeader::deserialize(&payload)
            .map_err(|e| NormalizationError::malformed("stripe webhook", e))?;

        Ok(WebhookEnvelope {
            kind: header.kind,
            external_id: Some(header.id),
            account_hint: header.account,
            payload,
        })
    }

    #[instrument(skip(self, ctx), fields(connection_id = %ctx.connection_id))]
    async fn test_connection(&self, ctx: &ConnectionContext) -> Result<(), ConnectorError> {
        let response = ctx.send(self.request(ctx, "balance")).await?;
        let body: Value = response.json().map_err(ConnectorError::malformed)?;
        match body.get("object").and_then(Value::as_str) {
            Some("balance") => Ok(()),
            _ => Err(ConnectorError::malformed("balance response has unexpected shape")),
        }
    }

    #[instrument(
        skip(self, ctx, request),
        fields(connection_id = %ctx.connection_id, entity_type = %request.entity_type)
    )]
    async fn fetch_page(&self, ctx: &ConnectionContext, request: &PageRequest) -> Result<Page, ConnectorError> {
        let entity = request.entity_type.as_str();
        if !ENTITY_TYPES.contains(&entity) {
            return Err(ConnectorError::ConfigurationError {
                details: format!("stripe has no entity type '{entity}'"),
            });
        }

        let mut outbound = self
            .request(ctx, entity)
            .query("limit", request.page_size.min(MAX_LIST_LIMIT).to_string())
            .query("created[gte]", request.window.since.timestamp().to_string())
            .query("created[lte]", request.window.until.timestamp().to_string());
        if let Some(after) = request.cursor.as_ref().and_then(Cursor::as_param) {
            outbound = outbound.query("starting_after", after);
        }

        let list: ListResponse = ctx
            .send(outbound)
            .await?
            .json()
            .map_err(ConnectorError::malformed)?;

        let next_cursor = if list.has_more {
            let last_id = list
                .data
                .last()
                .and_then(|record| record.get("id"))
                .and_then(Value::as_str)
                .ok_or_else(|| ConnectorError::malformed("has_more set but last object has no id"))?;
            Some(Cursor::from_string(last_id))
        } else {
            None
        };
        debug!(records = list.data.len(), has_more = list.has_more, "fetched stripe page");

        Ok(Page {
            records: list.data,
            next_cursor,
        })
    }
}
