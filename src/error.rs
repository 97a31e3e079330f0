//! # Error Handling
//!
//! [`IngestError`] is the engine-wide error taxonomy; [`ApiError`] is its problem+json
//! rendering with trace ID propagation.

use axum::{
    extract::rejection::JsonRejection,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::telemetry;

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds (optional)
    pub retry_after: Option<u64>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    /// Set retry after delay
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Active request trace id, or a generated correlation id outside a request scope
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| Some(format!("corr-{}", &Uuid::new_v4().to_string()[..8]).into_boxed_str()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

/// True when `error` is a unique-constraint violation on Postgres, MySQL or SQLite.
pub fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const MYSQL_DUPLICATE_CODES: &[&str] = &["1022", "1062", "1169", "1586"];
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        sea_orm::DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | sea_orm::DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error.code().is_some_and(|code| {
        let code = code.as_ref();
        code == PG_UNIQUE
            || MYSQL_DUPLICATE_CODES.contains(&code)
            || SQLITE_DUPLICATE_CODES.contains(&code)
    })
}

/// Engine error taxonomy shared by webhook ingestion and backfill.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("signature verification failed for {provider}: {reason}")]
    SignatureInvalid { provider: String, reason: String },

    #[error("malformed payload: {0}")]
    PayloadMalformed(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("no connection matches {0}")]
    ConnectionNotFound(String),

    #[error("connection {connection_id} is {status}")]
    ConnectionInactive { connection_id: Uuid, status: String },

    #[error("rate limit exceeded")]
    RateLimitExceeded { retry_after_secs: Option<u64> },

    #[error("{provider} unavailable: {message}")]
    UpstreamUnavailable { provider: String, message: String },

    #[error("{provider} rejected the stored credential: {message}")]
    AuthorizationFailed { provider: String, message: String },

    /// Unique-key collision on write. The writer absorbs these; it is never returned upward.
    #[error("record already exists")]
    PersistenceConflict,

    #[error("a sync is already running for connection {connection_id}")]
    SyncInProgress { connection_id: Uuid },

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl IngestError {
    pub fn signature(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SignatureInvalid {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SignatureInvalid { .. } => "SIGNATURE_INVALID",
            Self::PayloadMalformed(_) => "PAYLOAD_MALFORMED",
            Self::ValidationFailed(_) => "VALIDATION_FAILED",
            Self::ConnectionNotFound(_) => "CONNECTION_NOT_FOUND",
            Self::ConnectionInactive { .. } => "CONNECTION_INACTIVE",
            Self::RateLimitExceeded { .. } => "RATE_LIMITED",
            Self::UpstreamUnavailable { .. } => "UPSTREAM_UNAVAILABLE",
            Self::AuthorizationFailed { .. } => "AUTHORIZATION_FAILED",
            Self::PersistenceConflict => "PERSISTENCE_CONFLICT",
            Self::SyncInProgress { .. } => "SYNC_IN_PROGRESS",
            Self::Cancelled => "CANCELLED",
            Self::Internal(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::SignatureInvalid { .. } => StatusCode::UNAUTHORIZED,
            Self::PayloadMalformed(_) | Self::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            Self::ConnectionNotFound(_) | Self::ConnectionInactive { .. } => StatusCode::NOT_FOUND,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::SyncInProgress { .. } | Self::PersistenceConflict => StatusCode::CONFLICT,
            Self::UpstreamUnavailable { .. } | Self::AuthorizationFailed { .. } => {
                StatusCode::BAD_GATEWAY
            }
            Self::Cancelled => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a human has to act (re-authorize, fix a secret, reconnect) rather than wait.
    pub fn requires_intervention(&self) -> bool {
        matches!(
            self,
            Self::SignatureInvalid { .. }
                | Self::ConnectionNotFound(_)
                | Self::ConnectionInactive { .. }
                | Self::AuthorizationFailed { .. }
        )
    }
}

impl From<sea_orm::DbErr> for IngestError {
    fn from(error: sea_orm::DbErr) -> Self {
        if is_unique_violation(&error) {
            return Self::PersistenceConflict;
        }
        Self::Internal(anyhow::Error::new(error))
    }
}

impl From<IngestError> for ApiError {
    fn from(error: IngestError) -> Self {
        let status = error.status_code();
        let code = error.code();
        match error {
            IngestError::SignatureInvalid { ref provider, .. } => {
                // Reason stays in logs; callers only learn that verification failed.
                ApiError::new(status, code, "Signature verification failed")
                    .with_details(json!({ "provider": provider }))
            }
            IngestError::RateLimitExceeded { retry_after_secs } => {
                let api = ApiError::new(status, code, "Rate limit exceeded");
                match retry_after_secs {
                    Some(secs) => api.with_retry_after(secs),
                    None => api,
                }
            }
            IngestError::UpstreamUnavailable {
                ref provider,
                ref message,
            } => ApiError::new(status, code, &format!("Provider {provider} unavailable"))
                .with_details(json!({
                    "provider": provider,
                    "reason": message,
                    "requires_intervention": false,
                })),
            IngestError::AuthorizationFailed {
                ref provider,
                ref message,
            } => ApiError::new(
                status,
                code,
                &format!("Provider {provider} rejected the stored credential"),
            )
            .with_details(json!({
                "provider": provider,
                "reason": message,
                "requires_intervention": true,
            })),
            IngestError::Internal(ref inner) => {
                tracing::error!(error = ?inner, "internal error");
                ApiError::new(status, code, "An internal error occurred")
            }
            other => ApiError::new(status, code, &other.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        IngestError::Internal(error).into()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match rejection {
            JsonRejection::JsonDataError(err) => format!("Invalid JSON: {}", err),
            JsonRejection::JsonSyntaxError(err) => format!("JSON syntax error: {}", err),
            JsonRejection::MissingJsonContentType(_) => {
                "Missing 'Content-Type: application/json' header".to_string()
            }
            _ => "Invalid request body".to_string(),
        };

        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", &message)
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        if is_unique_violation(&error) {
            tracing::debug!(?error, "Unique constraint violation detected");
            return Self::new(StatusCode::CONFLICT, "CONFLICT", "Resource already exists");
        }

        match error {
            sea_orm::DbErr::RecordNotFound(record) => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("Record not found: {}", record),
            ),
            sea_orm::DbErr::Conn(connection_err) => {
                tracing::error!("Database connection error: {:?}", connection_err);
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Database service unavailable",
                )
            }
            other => {
                tracing::error!("Database error: {:?}", other);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Database error occurred",
                )
            }
        }
    }
}

/// Create a validation error with field details
pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message).with_details(field_errors)
}

/// Create a not found error (404)
pub fn not_found(message: &str) -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_with_retry_after() {
        let error = ApiError::new(StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", "slow down")
            .with_retry_after(60);
        assert_eq!(error.retry_after, Some(60));

        let response = error.into_response();
        assert_eq!(response.headers().get("retry-after").unwrap(), "60");
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/problem+json"
        );
    }

    #[test]
    fn test_trace_id_generation() {
        let error = ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "X", "Test error");
        let trace_id = error.trace_id.unwrap();
        assert!(trace_id.starts_with("corr-"));
        assert_eq!(trace_id.len(), 13);
    }

    #[test]
    fn ingest_errors_map_to_documented_statuses() {
        let cases: Vec<(IngestError, StatusCode)> = vec![
            (IngestError::signature("stripe", "bad mac"), StatusCode::UNAUTHORIZED),
            (
                IngestError::PayloadMalformed("x".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                IngestError::ValidationFailed("x".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                IngestError::ConnectionNotFound("shop".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                IngestError::ConnectionInactive {
                    connection_id: Uuid::nil(),
                    status: "disconnected".into(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                IngestError::RateLimitExceeded {
                    retry_after_secs: Some(3),
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                IngestError::SyncInProgress {
                    connection_id: Uuid::nil(),
                },
                StatusCode::CONFLICT,
            ),
            (
                IngestError::UpstreamUnavailable {
                    provider: "shopify".into(),
                    message: "503".into(),
                },
                StatusCode::BAD_GATEWAY,
            ),
            (
                IngestError::Internal(anyhow::anyhow!("boom")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in cases {
            let api: ApiError = error.into();
            assert_eq!(api.status, expected, "code {}", api.code);
        }
    }

    #[test]
    fn signature_error_does_not_leak_reason() {
        let api: ApiError = IngestError::signature("shopify", "expected abc got def").into();
        assert!(!api.message.contains("abc"));
        assert_eq!(api.code.as_ref(), "SIGNATURE_INVALID");
    }

    #[test]
    fn rate_limit_carries_retry_after() {
        let api: ApiError = IngestError::RateLimitExceeded {
            retry_after_secs: Some(7),
        }
        .into();
        assert_eq!(api.retry_after, Some(7));
    }

    #[test]
    fn intervention_is_flagged_for_credential_problems_only() {
        assert!(
            IngestError::AuthorizationFailed {
                provider: "stripe".into(),
                message: "401".into()
            }
            .requires_intervention()
        );
        assert!(
            !IngestError::UpstreamUnavailable {
                provider: "stripe".into(),
                message: "503".into()
            }
            .requires_intervention()
        );
        assert!(
            !IngestError::RateLimitExceeded {
                retry_after_secs: None
            }
            .requires_intervention()
        );
    }

    #[test]
    fn internal_error_message_is_generic() {
        let api: ApiError = anyhow::anyhow!("db password is hunter2").into();
        assert_eq!(api.message.as_ref(), "An internal error occurred");
    }

    #[test]
    fn record_not_found_maps_to_404() {
        let api: ApiError = sea_orm::DbErr::RecordNotFound("connection".to_string()).into();
        assert_eq!(api.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn non_unique_db_error_is_internal() {
        let error: IngestError = sea_orm::DbErr::Custom("nope".to_string()).into();
        assert!(matches!(error, IngestError::Internal(_)));
    }
}
