//! Shopify adapter
//!
//! Admin REST API with a per-shop access token. History is paged with `since_id`; webhooks
//! are signed with a base64 HMAC of the body.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::config::AppConfig;
use crate::connectors::trait_::{
    ConnectionAdapter, ConnectionContext, ConnectorError, Cursor, Page, PageRequest,
    WebhookEnvelope,
};
use crate::connectors::{AuthType, PaginationStyle, Provider, ProviderMetadata};
use crate::normalization::NormalizationError;
use crate::request_queue::{OutboundRequest, OutboundResponse, ThrottleHint};
use crate::webhook_verification::{
    SHOPIFY_SIGNATURE_HEADER, VerificationError, VerificationResult, verify_shopify_signature,
};

pub const TOPIC_HEADER: &str = "x-shopify-topic";
pub const WEBHOOK_ID_HEADER: &str = "x-shopify-webhook-id";
pub const SHOP_DOMAIN_HEADER: &str = "x-shopify-shop-domain";
pub const ACCESS_TOKEN_HEADER: &str = "x-shopify-access-token";
pub const CALL_LIMIT_HEADER: &str = "x-shopify-shop-api-call-limit";

const ENTITY_TYPES: &[&str] = &["orders", "customers"];

/// Pause when this few calls remain in the shop's leaky bucket.
const CALL_LIMIT_HEADROOM: u32 = 2;

#[derive(Clone)]
pub struct ShopifyAdapter {
    webhook_secret: Option<String>,
    api_base: Option<String>,
    api_version: String,
}

impl ShopifyAdapter {
    /// `api_base` replaces `https://{shop}` for every shop (used against mock servers).
    pub fn new(webhook_secret: Option<String>, api_base: Option<String>, api_version: String) -> Self {
        Self {
            webhook_secret,
            api_base,
            api_version,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.webhooks.shopify_secret.clone(),
            config.providers.shopify_api_base.clone(),
            config.providers.shopify_api_version.clone(),
        )
    }

    fn admin_base(&self, shop: &str) -> String {
        let origin = match &self.api_base {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => format!("https://{}", normalize_shop_domain(shop)),
        };
        format!("{origin}/admin/api/{}", self.api_version)
    }

    fn request(&self, ctx: &ConnectionContext, path: &str) -> OutboundRequest {
        OutboundRequest::get(format!("{}/{path}", self.admin_base(&ctx.provider_account_id)))
            .header(ACCESS_TOKEN_HEADER, ctx.credential())
            .header("accept", "application/json")
    }
}

/// `Acme`, `acme.myshopify.com/` and `https://ACME.myshopify.com` all name the same shop.
pub fn normalize_shop_domain(shop: &str) -> String {
    let trimmed = shop
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_ascii_lowercase();
    if trimmed.contains('.') {
        trimmed
    } else {
        format!("{trimmed}.myshopify.com")
    }
}

/// Reads `used/max` from the call-limit header and asks the queue to pause near the top.
fn call_limit_pause(response: &OutboundResponse) -> Option<Duration> {
    let (used, max) = response.header(CALL_LIMIT_HEADER)?.split_once('/')?;
    let used: u32 = used.trim().parse().ok()?;
    let max: u32 = max.trim().parse().ok()?;
    (max.saturating_sub(used) <= CALL_LIMIT_HEADROOM).then_some(Duration::from_secs(1))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl ConnectionAdapter for ShopifyAdapter {
    fn provider(&self) -> Provider {
        Provider::Shopify
    }

    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            provider: Provider::Shopify,
            auth_type: AuthType::AccessToken,
            pagination: PaginationStyle::SinceId,
            entity_types: ENTITY_TYPES.iter().map(|s| s.to_string()).collect(),
            signature_header: SHOPIFY_SIGNATURE_HEADER.to_string(),
        }
    }

    fn entity_types(&self) -> &'static [&'static str] {
        ENTITY_TYPES
    }

    fn pagination_style(&self) -> PaginationStyle {
        PaginationStyle::SinceId
    }

    fn throttle_hint(&self) -> Option<ThrottleHint> {
        Some(call_limit_pause as ThrottleHint)
    }

    fn verify_signature(&self, headers: &HeaderMap, body: &[u8], _now_unix: i64) -> VerificationResult<()> {
        let signature = header_str(headers, SHOPIFY_SIGNATURE_HEADER).ok_or_else(|| {
            VerificationError::MissingSignature {
                header: SHOPIFY_SIGNATURE_HEADER.to_string(),
            }
        })?;
        verify_shopify_signature(body, signature, self.webhook_secret.as_deref().unwrap_or(""))
    }

    fn parse_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<WebhookEnvelope, NormalizationError> {
        let kind = header_str(headers, TOPIC_HEADER)
            .ok_or_else(|| NormalizationError::malformed("shopify webhook", "missing x-shopify-topic"))?
            .to_ascii_lowercase();
        let payload: Value =
            serde_json::from_slice(body).map_err(|e| NormalizationError::malformed(&kind, e))?;
        if !payload.is_object() {
            return Err(NormalizationError::malformed(&kind, "body is not a JSON object"));
        }

        Ok(WebhookEnvelope {
            external_id: header_str(headers, WEBHOOK_ID_HEADER).map(str::to_string),
            account_hint: header_str(headers, SHOP_DOMAIN_HEADER).map(normalize_shop_domain),
            kind,
            payload,
        })
    }

    #[instrument(skip(self, ctx), fields(connection_id = %ctx.connection_id))]
    async fn test_connection(&self, ctx: &ConnectionContext) -> Result<(), ConnectorError> {
        let response = ctx.send(self.request(ctx, "shop.json")).await?;
        let body: Value = response.json().map_err(ConnectorError::malformed)?;
        if body.get("shop").is_some_and(Value::is_object) {
            Ok(())
        } else {
            Err(ConnectorError::malformed("shop.json response has no shop object"))
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
                details: format!("shopify has no entity type '{entity}'"),
            });
        }

        let mut outbound = self
            .request(ctx, &format!("{entity}.json"))
            .query("limit", request.page_size.to_string())
            .query("created_at_min", request.window.since.to_rfc3339())
            .query("created_at_max", request.window.until.to_rfc3339());
        if entity == "orders" {
            outbound = outbound.query("status", "any");
        }
        if let Some(since_id) = request.cursor.as_ref().and_then(Cursor::as_param) {
            outbound = outbound.query("since_id", since_id);
        }

        let response = ctx.send(outbound).await?;
        let mut body: Value = response.json().map_err(ConnectorError::malformed)?;
        let records = match body.get_mut(entity).map(Value::take) {
            Some(Value::Array(records)) => records,
            _ => {
                return Err(ConnectorError::malformed(format!(
                    "{entity}.json response has no '{entity}' array"
                )));
            }
        };

        let next_cursor = records
            .last()
            .and_then(|record| record.get("id"))
            .cloned()
            .map(Cursor::from);
        debug!(records = records.len(), "fetched shopify page");

        Ok(Page {
            records,
            next_cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook_verification::sign_shopify;
    use axum::http::HeaderValue;
    use std::collections::HashMap;

    fn adapter() -> ShopifyAdapter {
        ShopifyAdapter::new(Some("shpss_secret".into()), None, "2024-10".into())
    }

    #[test]
    fn normalizes_shop_domains() {
        assert_eq!(normalize_shop_domain("Acme"), "acme.myshopify.com");
        assert_eq!(
            normalize_shop_domain("https://ACME.myshopify.com/"),
            "acme.myshopify.com"
        );
        assert_eq!(
            adapter().admin_base("acme"),
            "https://acme.myshopify.com/admin/api/2024-10"
        );
    }

    #[test]
    fn call_limit_near_the_top_pauses() {
        let mut response = OutboundResponse {
            status: 200,
            headers: HashMap::new(),
            body: Vec::new(),
        };
        assert_eq!(call_limit_pause(&response), None);

        response
            .headers
            .insert(CALL_LIMIT_HEADER.to_string(), "20/40".to_string());
        assert_eq!(call_limit_pause(&response), None);

        response
            .headers
            .insert(CALL_LIMIT_HEADER.to_string(), "39/40".to_string());
        assert_eq!(call_limit_pause(&response), Some(Duration::from_secs(1)));
    }

    #[test]
    fn verifies_signed_delivery() {
        let body = br#"{"id":1}"#;
        let mut headers = HeaderMap::new();
        headers.insert(
            SHOPIFY_SIGNATURE_HEADER,
            HeaderValue::from_str(&sign_shopify(body, "shpss_secret").unwrap()).unwrap(),
        );
        assert!(adapter().verify_signature(&headers, body, 0).is_ok());
        assert!(adapter().verify_signature(&headers, br#"{"id":2}"#, 0).is_err());
        assert!(matches!(
            adapter().verify_signature(&HeaderMap::new(), body, 0),
            Err(VerificationError::MissingSignature { .. })
        ));
    }

    #[test]
    fn unconfigured_secret_rejects() {
        let adapter = ShopifyAdapter::new(None, None, "2024-10".into());
        let mut headers = HeaderMap::new();
        headers.insert(SHOPIFY_SIGNATURE_HEADER, HeaderValue::from_static("AAAA"));
        assert!(matches!(
            adapter.verify_signature(&headers, b"{}", 0),
            Err(VerificationError::NotConfigured { .. })
        ));
    }

    #[test]
    fn parses_webhook_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(TOPIC_HEADER, HeaderValue::from_static("Orders/Paid"));
        headers.insert(WEBHOOK_ID_HEADER, HeaderValue::from_static("b54557e4"));
        headers.insert(SHOP_DOMAIN_HEADER, HeaderValue::from_static("acme.myshopify.com"));

        let envelope = adapter().parse_webhook(&headers, br#"{"id":1}"#).unwrap();
        assert_eq!(envelope.kind, "orders/paid");
        assert_eq!(envelope.external_id.as_deref(), Some("b54557e4"));
        assert_eq!(envelope.account_hint.as_deref(), Some("acme.myshopify.com"));

        assert!(adapter().parse_webhook(&headers, b"not json").is_err());
        assert!(adapter().parse_webhook(&headers, b"[1,2]").is_err());
        assert!(adapter().parse_webhook(&HeaderMap::new(), b"{}").is_err());
    }
}
