//! # Webhook Signature Verification
//!
//! HMAC-SHA256 verification for Shopify (base64 digest over the raw body) and Stripe
//! (`t=<unix>,v1=<hex>` over `"{t}.{body}"` with a replay window). All digest comparisons are
//! constant time. Failures are logged with the provider and a reason, never the secret or body.

use axum::http::StatusCode;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

pub const SHOPIFY_SIGNATURE_HEADER: &str = "x-shopify-hmac-sha256";
pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

/// Errors that can occur during webhook signature verification
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("Missing required signature header: {header}")]
    MissingSignature { header: String },

    #[error("Invalid signature format: {header}")]
    InvalidSignatureFormat { header: String },

    #[error("Signature verification failed")]
    VerificationFailed,

    #[error("Missing signature timestamp")]
    MissingTimestamp,

    #[error("Invalid signature timestamp")]
    InvalidTimestamp,

    #[error("Timestamp too old: {seconds}s old, max allowed: {max_seconds}s")]
    TimestampTooOld { seconds: u64, max_seconds: u64 },

    #[error("Timestamp too far in future: {seconds}s in future, max allowed: {max_seconds}s")]
    TimestampTooFuture { seconds: u64, max_seconds: u64 },

    #[error("Webhook verification not configured for provider: {provider}")]
    NotConfigured { provider: String },
}

impl VerificationError {
    pub fn status_code(&self) -> StatusCode {
        StatusCode::UNAUTHORIZED
    }

    /// Short reason suitable for logs and metrics labels.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingSignature { .. } => "missing_signature",
            Self::InvalidSignatureFormat { .. } => "invalid_format",
            Self::VerificationFailed => "mismatch",
            Self::MissingTimestamp => "missing_timestamp",
            Self::InvalidTimestamp => "invalid_timestamp",
            Self::TimestampTooOld { .. } => "replay_window",
            Self::TimestampTooFuture { .. } => "future_timestamp",
            Self::NotConfigured { .. } => "not_configured",
        }
    }
}

pub type VerificationResult<T> = Result<T, VerificationError>;

fn mac_for(secret: &str, provider: &str) -> VerificationResult<HmacSha256> {
    if secret.is_empty() {
        return Err(VerificationError::NotConfigured {
            provider: provider.to_string(),
        });
    }
    HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| VerificationError::VerificationFailed)
}

/// Verifies a Shopify webhook: base64(HMAC-SHA256(secret, body)) against `X-Shopify-Hmac-Sha256`.
pub fn verify_shopify_signature(
    body: &[u8],
    signature_header: &str,
    secret: &str,
) -> VerificationResult<()> {
    debug!(body_size = body.len(), "verifying shopify signature");

    let signature_header = signature_header.trim();
    if signature_header.is_empty() {
        return Err(VerificationError::MissingSignature {
            header: SHOPIFY_SIGNATURE_HEADER.to_string(),
        });
    }

    let provided = BASE64.decode(signature_header).map_err(|_| {
        VerificationError::InvalidSignatureFormat {
            header: format!("{SHOPIFY_SIGNATURE_HEADER} is not valid base64"),
        }
    })?;

    let mut mac = mac_for(secret, "shopify")?;
    mac.update(body);
    let expected = mac.finalize().into_bytes();

    if expected.as_slice().ct_eq(&provided).into() {
        Ok(())
    } else {
        Err(VerificationError::VerificationFailed)
    }
}

/// Parsed `Stripe-Signature` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripeSignatureHeader {
    pub timestamp: i64,
    pub signatures: Vec<String>,
}

impl StripeSignatureHeader {
    /// Parse `t=<unix>,v1=<hex>[,v1=<hex>...]`. Other schemes (`v0`) are ignored.
    pub fn parse(header: &str) -> VerificationResult<Self> {
        let mut timestamp = None;
        let mut signatures = Vec::new();

        for item in header.split(',') {
            let Some((key, value)) = item.trim().split_once('=') else {
                return Err(VerificationError::InvalidSignatureFormat {
                    header: format!("{STRIPE_SIGNATURE_HEADER} has an element without '='"),
                });
            };
            match key {
                "t" => {
                    timestamp = Some(
                        value
                            .parse::<i64>()
                            .map_err(|_| VerificationError::InvalidTimestamp)?,
                    )
                }
                "v1" => signatures.push(value.to_string()),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(VerificationError::MissingTimestamp)?;
        if signatures.is_empty() {
            return Err(VerificationError::InvalidSignatureFormat {
                header: format!("{STRIPE_SIGNATURE_HEADER} carries no v1 signature"),
            });
        }

        Ok(Self {
            timestamp,
            signatures,
        })
    }
}

/// Verifies a Stripe webhook.
///
/// The timestamp must be within `tolerance_seconds` of `now_unix` in either direction; an
/// out-of-window delivery is rejected even when its HMAC matches. Any one matching `v1`
/// signature is accepted (Stripe sends several while a secret is being rolled).
pub fn verify_stripe_signature(
    body: &[u8],
    signature_header: &str,
    secret: &str,
    tolerance_seconds: u64,
    now_unix: i64,
) -> VerificationResult<()> {
    debug!(
        body_size = body.len(),
        tolerance_seconds, "verifying stripe signature"
    );

    if signature_header.trim().is_empty() {
        return Err(VerificationError::MissingSignature {
            header: STRIPE_SIGNATURE_HEADER.to_string(),
        });
    }

    let parsed = StripeSignatureHeader::parse(signature_header)?;

    let time_diff = now_unix.abs_diff(parsed.timestamp);
    if time_diff > tolerance_seconds {
        return Err(if now_unix > parsed.timestamp {
            VerificationError::TimestampTooOld {
                seconds: time_diff,
                max_seconds: tolerance_seconds,
            }
        } else {
            VerificationError::TimestampTooFuture {
                seconds: time_diff,
                max_seconds: tolerance_seconds,
            }
        });
    }

    let mut mac = mac_for(secret, "stripe")?;
    mac.update(parsed.timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    let expected = mac.finalize().into_bytes();

    let matched = parsed
        .signatures
        .iter()
        .filter_map(|candidate| hex::decode(candidate).ok())
        .fold(subtle::Choice::from(0u8), |acc, provided| {
            acc | expected.as_slice().ct_eq(&provided)
        });

    if matched.into() {
        Ok(())
    } else {
        Err(VerificationError::VerificationFailed)
    }
}

/// Logs a rejected delivery without echoing secrets or payload.
pub fn log_rejection(provider: &str, error: &VerificationError) {
    warn!(
        provider = %provider,
        reason = error.reason(),
        detail = %error,
        "webhook signature rejected"
    );
}

/// Computes the Shopify header value for `body`.
pub fn sign_shopify(body: &[u8], secret: &str) -> VerificationResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| VerificationError::VerificationFailed)?;
    mac.update(body);
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Computes a `Stripe-Signature` header value for `body` at `timestamp`.
pub fn sign_stripe(body: &[u8], secret: &str, timestamp: i64) -> VerificationResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| VerificationError::VerificationFailed)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}
