//! Connection adapter interface
//!
//! Every provider implements [`ConnectionAdapter`]; the sync orchestrator, the paginated
//! fetcher and the webhook handlers only ever talk to this trait.

use std::fmt;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::connectors::{PaginationStyle, Provider, ProviderMetadata};
use crate::error::IngestError;
use crate::normalization::{MetricDraft, NormalizationError, ProviderEvent};
use crate::request_queue::{
    OutboundRequest, OutboundResponse, QueueError, RequestQueueHandle, ThrottleHint,
};
use crate::webhook_verification::VerificationResult;

/// Connector-specific error types for structured error handling
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConnectorError {
    /// HTTP error from upstream provider
    #[error("HTTP error {status}: {}", .body.as_deref().unwrap_or("No body"))]
    HttpError { status: u16, body: Option<String> },
    /// Response did not have the expected shape
    #[error("Malformed response: {details}")]
    MalformedResponse { details: String },
    /// Network or connectivity error
    #[error("Network error: {details}")]
    NetworkError { details: String, retryable: bool },
    /// Provider rejected the credential
    #[error("Authentication error: {details}")]
    AuthenticationError {
        details: String,
        status: Option<u16>,
    },
    /// Retries exhausted against a throttling provider
    #[error("Rate limit exceeded")]
    RateLimitError { retry_after: Option<u64> },
    /// Adapter or connection misconfigured
    #[error("Configuration error: {details}")]
    ConfigurationError { details: String },
}

impl ConnectorError {
    pub fn malformed(details: impl fmt::Display) -> Self {
        Self::MalformedResponse {
            details: details.to_string(),
        }
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::AuthenticationError { .. })
    }

    pub fn into_ingest(self, provider: Provider) -> IngestError {
        let provider = provider.to_string();
        match self {
            ConnectorError::AuthenticationError { details, .. } => IngestError::AuthorizationFailed {
                provider,
                message: details,
            },
            ConnectorError::RateLimitError { retry_after } => IngestError::RateLimitExceeded {
                retry_after_secs: retry_after,
            },
            ConnectorError::MalformedResponse { details } => {
                IngestError::ValidationFailed(format!("{provider} response: {details}"))
            }
            ConnectorError::ConfigurationError { details } => {
                IngestError::Internal(anyhow::anyhow!("{provider} adapter: {details}"))
            }
            other => IngestError::UpstreamUnavailable {
                provider,
                message: other.to_string(),
            },
        }
    }
}

impl From<QueueError> for ConnectorError {
    fn from(error: QueueError) -> Self {
        match error {
            QueueError::RateLimitExceeded { retry_after, .. } => ConnectorError::RateLimitError {
                retry_after: retry_after.map(|d| d.as_secs().max(1)),
            },
            QueueError::UpstreamUnavailable {
                status: Some(status),
                reason,
                ..
            } => ConnectorError::HttpError {
                status,
                body: Some(reason),
            },
            QueueError::UpstreamUnavailable { reason, .. } => ConnectorError::NetworkError {
                details: reason,
                retryable: true,
            },
            timeout @ QueueError::Timeout { .. } => ConnectorError::NetworkError {
                details: timeout.to_string(),
                retryable: true,
            },
            QueueError::Closed => ConnectorError::NetworkError {
                details: "request queue closed".to_string(),
                retryable: false,
            },
        }
    }
}

/// Classify a final (post-retry) response.
pub fn ensure_success(response: OutboundResponse) -> Result<OutboundResponse, ConnectorError> {
    match response.status {
        200..=299 => Ok(response),
        401 | 403 => Err(ConnectorError::AuthenticationError {
            details: response.body_snippet(),
            status: Some(response.status),
        }),
        429 => Err(ConnectorError::RateLimitError {
            retry_after: response.retry_after().map(|d| d.as_secs().max(1)),
        }),
        status => Err(ConnectorError::HttpError {
            status,
            body: Some(response.body_snippet()),
        }),
    }
}

/// Sync-specific error types for structured error handling during sync operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncError {
    #[serde(flatten)]
    pub kind: SyncErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// Authentication/authorization failure
    Unauthorized,
    /// Rate limited with optional retry after hint
    RateLimited {
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
    /// Transient/retryable error
    Transient,
    /// Permanent/non-retryable error
    Permanent,
}

impl SyncError {
    fn with_kind(kind: SyncErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn unauthorized<S: Into<String>>(message: S) -> Self {
        Self::with_kind(SyncErrorKind::Unauthorized, message)
    }

    pub fn rate_limited(retry_after_secs: Option<u64>) -> Self {
        Self {
            kind: SyncErrorKind::RateLimited { retry_after_secs },
            message: None,
        }
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::with_kind(SyncErrorKind::Transient, message)
    }

    pub fn permanent<S: Into<String>>(message: S) -> Self {
        Self::with_kind(SyncErrorKind::Permanent, message)
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            SyncErrorKind::Unauthorized => write!(f, "Unauthorized")?,
            SyncErrorKind::RateLimited { retry_after_secs } => {
                write!(f, "Rate limited")?;
                if let Some(after) = retry_after_secs {
                    write!(f, " (retry after: {}s)", after)?;
                }
            }
            SyncErrorKind::Transient => write!(f, "Transient error")?,
            SyncErrorKind::Permanent => write!(f, "Permanent error")?,
        }
        if let Some(msg) = &self.message {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

impl std::error::Error for SyncError {}

impl From<ConnectorError> for SyncError {
    fn from(error: ConnectorError) -> Self {
        match error {
            ConnectorError::RateLimitError { retry_after } => SyncError::rate_limited(retry_after),
            ConnectorError::AuthenticationError { details, .. } => SyncError::unauthorized(details),
            ConnectorError::NetworkError { details, retryable } => {
                if retryable {
                    SyncError::transient(details)
                } else {
                    SyncError::permanent(details)
                }
            }
            ConnectorError::HttpError { status, body } => {
                let message = format!("HTTP error {}: {}", status, body.unwrap_or_default());
                if (400..500).contains(&status) {
                    SyncError::permanent(message)
                } else {
                    SyncError::transient(message)
                }
            }
            ConnectorError::MalformedResponse { details } => {
                SyncError::transient(format!("Malformed response: {}", details))
            }
            ConnectorError::ConfigurationError { details } => {
                SyncError::permanent(format!("Configuration error: {}", details))
            }
        }
    }
}

impl From<&IngestError> for SyncError {
    fn from(error: &IngestError) -> Self {
        match error {
            IngestError::AuthorizationFailed { message, .. } => SyncError::unauthorized(message.clone()),
            IngestError::RateLimitExceeded { retry_after_secs } => {
                SyncError::rate_limited(*retry_after_secs)
            }
            IngestError::UpstreamUnavailable { .. } | IngestError::Cancelled => {
                SyncError::transient(error.to_string())
            }
            other => SyncError::permanent(other.to_string()),
        }
    }
}

/// Pagination position.
///
/// Wraps an opaque JSON payload returned by adapters (a page token or the last seen id).
/// It is persisted as-is in `sync_cursors.position` and must round-trip without alteration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Cursor(pub Value);

impl Cursor {
    pub fn from_string<S: Into<String>>(value: S) -> Self {
        Self(Value::String(value.into()))
    }

    pub fn as_json(&self) -> &Value {
        &self.0
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_str()
    }

    /// The cursor as a query-string value: strings verbatim, numbers in decimal.
    pub fn as_param(&self) -> Option<String> {
        match &self.0 {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

impl From<Value> for Cursor {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl From<Cursor> for Value {
    fn from(cursor: Cursor) -> Self {
        cursor.0
    }
}

/// Time range a backfill covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWindow {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

/// Everything an adapter needs to call the provider on behalf of one connection.
pub struct ConnectionContext {
    pub connection_id: Uuid,
    pub organization_id: Uuid,
    pub provider_account_id: String,
    credential: Zeroizing<String>,
    queue: RequestQueueHandle,
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("connection_id", &self.connection_id)
            .field("organization_id", &self.organization_id)
            .field("provider_account_id", &self.provider_account_id)
            .field("credential", &"[REDACTED]")
            .finish()
    }
}

impl ConnectionContext {
    pub fn new(
        connection_id: Uuid,
        organization_id: Uuid,
        provider_account_id: String,
        credential: Zeroizing<String>,
        queue: RequestQueueHandle,
    ) -> Self {
        Self {
            connection_id,
            organization_id,
            provider_account_id,
            credential,
            queue,
        }
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }

    /// Send through the connection's rate-limited queue and reject non-2xx outcomes.
    pub async fn send(&self, request: OutboundRequest) -> Result<OutboundResponse, ConnectorError> {
        let response = self.queue.enqueue(request).await?;
        ensure_success(response)
    }
}

/// One page request from the paginated fetcher.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub entity_type: String,
    pub window: SyncWindow,
    pub cursor: Option<Cursor>,
    pub page_size: u32,
}

/// One page of raw provider records.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<Value>,
    /// Where the next page starts: a provider token, or the last record id. `None` when the
    /// provider reported this as the final page.
    pub next_cursor: Option<Cursor>,
}

/// A verified inbound webhook, split into the parts the pipeline needs.
#[derive(Debug, Clone)]
pub struct WebhookEnvelope {
    /// Topic or event type
    pub kind: String,
    /// Provider delivery/event id, used for the receipt pre-check
    pub external_id: Option<String>,
    /// Account identifier carried by the delivery (shop domain, Connect account)
    pub account_hint: Option<String>,
    /// What the normalizer consumes for `kind`
    pub payload: Value,
}

#[async_trait]
pub trait ConnectionAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    fn metadata(&self) -> ProviderMetadata;

    /// Entity types a backfill walks, in order.
    fn entity_types(&self) -> &'static [&'static str];

    fn pagination_style(&self) -> PaginationStyle;

    /// Hook for providers that publish bucket usage in response headers.
    fn throttle_hint(&self) -> Option<ThrottleHint> {
        None
    }

    /// Check the delivery's signature against the raw body.
    fn verify_signature(&self, headers: &HeaderMap, body: &[u8], now_unix: i64) -> VerificationResult<()>;

    /// Extract kind, ids and the normalizer payload from a verified delivery.
    fn parse_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<WebhookEnvelope, NormalizationError>;

    /// Parse a payload into the typed event union.
    fn parse_event(&self, kind: &str, payload: &Value) -> Result<ProviderEvent, NormalizationError> {
        ProviderEvent::parse(self.provider(), kind, payload)
    }

    /// Map a payload to metric drafts. Unmapped kinds give an empty vector.
    fn normalize(&self, kind: &str, payload: &Value) -> Result<Vec<MetricDraft>, NormalizationError> {
        self.parse_event(kind, payload)?.into_drafts()
    }

    /// One lightweight authenticated call.
    async fn test_connection(&self, ctx: &ConnectionContext) -> Result<(), ConnectorError>;

    /// Fetch one page of `request.entity_type` records.
    async fn fetch_page(&self, ctx: &ConnectionContext, request: &PageRequest) -> Result<Page, ConnectorError>;
}
