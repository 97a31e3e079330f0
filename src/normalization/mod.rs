//! Event normalization.
//!
//! Maps provider payloads (webhook events and backfilled REST records) onto canonical
//! [`MetricDraft`]s. Everything here is pure: no I/O, no clock. Payloads are first parsed into
//! the typed union in [`payload`] so a missing required field fails fast as
//! [`NormalizationError::Malformed`] instead of deep inside a mapping.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::connectors::Provider;
use crate::error::IngestError;

pub mod payload;
pub mod shopify;
pub mod stripe;

pub use payload::{LifecycleAction, ProviderEvent};

/// Canonical metric kinds stored in `metric_records.metric_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Revenue,
    Orders,
    Refunds,
    Customers,
    Sessions,
    SubscriptionEvents,
}

impl MetricType {
    pub const fn as_str(self) -> &'static str {
        match self {
            MetricType::Revenue => "revenue",
            MetricType::Orders => "orders",
            MetricType::Refunds => "refunds",
            MetricType::Customers => "customers",
            MetricType::Sessions => "sessions",
            MetricType::SubscriptionEvents => "subscription_events",
        }
    }

    /// Whether `value` is an amount of money rather than a count.
    pub const fn is_monetary(self) -> bool {
        matches!(self, MetricType::Revenue | MetricType::Refunds)
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const ALL_METRIC_TYPES: &[MetricType] = &[
    MetricType::Revenue,
    MetricType::Orders,
    MetricType::Refunds,
    MetricType::Customers,
    MetricType::Sessions,
    MetricType::SubscriptionEvents,
];

impl FromStr for MetricType {
    type Err = NormalizationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_METRIC_TYPES
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| NormalizationError::UnknownMetricType(s.to_string()))
    }
}

/// A metric record ready for the idempotent writer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricDraft {
    pub metric_type: MetricType,
    pub value: f64,
    pub currency: Option<String>,
    pub source: String,
    pub source_event_id: String,
    pub occurred_at: DateTime<Utc>,
    /// Always carries `sourceEventId` and `source`.
    pub metadata: Value,
}

impl MetricDraft {
    pub fn new(
        provider: Provider,
        metric_type: MetricType,
        value: f64,
        source_event_id: String,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        let metadata = json!({
            "sourceEventId": source_event_id,
            "source": provider.as_str(),
        });
        Self {
            metric_type,
            value,
            currency: None,
            source: provider.as_str().to_string(),
            source_event_id,
            occurred_at,
            metadata,
        }
    }

    /// A count-of-one record (an order placed, a customer created...).
    pub fn count(
        provider: Provider,
        metric_type: MetricType,
        source_event_id: String,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self::new(provider, metric_type, 1.0, source_event_id, occurred_at)
    }

    pub fn with_currency(mut self, currency: &str) -> Self {
        self.currency = Some(currency.to_ascii_uppercase());
        self
    }

    /// Add a metadata field. `None` values are skipped.
    pub fn with_meta<V: Into<Value>>(mut self, key: &str, value: Option<V>) -> Self {
        if let (Some(value), Some(map)) = (value, self.metadata.as_object_mut()) {
            map.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn metadata_map(&self) -> Option<&Map<String, Value>> {
        self.metadata.as_object()
    }
}

/// Errors raised while parsing or mapping a provider payload.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NormalizationError {
    #[error("{kind} payload does not match the expected shape: {reason}")]
    Malformed { kind: String, reason: String },
    #[error("invalid amount in {field}: {value}")]
    InvalidAmount { field: &'static str, value: String },
    #[error("invalid timestamp in {field}: {value}")]
    InvalidTimestamp { field: &'static str, value: String },
    #[error("unknown metric type: {0}")]
    UnknownMetricType(String),
}

impl NormalizationError {
    pub(crate) fn malformed(kind: &str, reason: impl fmt::Display) -> Self {
        Self::Malformed {
            kind: kind.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<NormalizationError> for IngestError {
    fn from(error: NormalizationError) -> Self {
        IngestError::PayloadMalformed(error.to_string())
    }
}

/// ISO-4217 currencies with no minor unit (Stripe sends whole units for these).
const ZERO_DECIMAL_CURRENCIES: &[&str] = &[
    "BIF", "CLP", "DJF", "GNF", "JPY", "KMF", "KRW", "MGA", "PYG", "RWF", "UGX", "VND", "VUV",
    "XAF", "XOF", "XPF",
];

const THREE_DECIMAL_CURRENCIES: &[&str] = &["BHD", "JOD", "KWD", "OMR", "TND"];

/// Number of decimal places between a currency's minor and major unit.
pub fn minor_unit_exponent(currency: &str) -> i32 {
    let code = currency.to_ascii_uppercase();
    if ZERO_DECIMAL_CURRENCIES.contains(&code.as_str()) {
        0
    } else if THREE_DECIMAL_CURRENCIES.contains(&code.as_str()) {
        3
    } else {
        2
    }
}

/// Convert an amount in minor units (cents) to major units.
pub fn minor_to_major(amount: i64, currency: &str) -> f64 {
    match minor_unit_exponent(currency) {
        0 => amount as f64,
        exponent => amount as f64 / 10_f64.powi(exponent),
    }
}

/// Parse a decimal money string in major units, as Shopify sends them.
pub fn parse_decimal(field: &'static str, raw: &str) -> Result<f64, NormalizationError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| NormalizationError::InvalidAmount {
            field,
            value: raw.to_string(),
        })
}

pub fn timestamp_from_unix(field: &'static str, seconds: i64) -> Result<DateTime<Utc>, NormalizationError> {
    DateTime::from_timestamp(seconds, 0).ok_or_else(|| NormalizationError::InvalidTimestamp {
        field,
        value: seconds.to_string(),
    })
}

/// Parse `payload` as a `kind` event from `provider` and map it to metric drafts.
///
/// `kind` is a webhook topic/event type (`orders/paid`, `charge.succeeded`) or a backfill
/// entity type (`orders`, `charges`). Unmapped kinds yield an empty vector, not an error.
pub fn normalize(
    provider: Provider,
    kind: &str,
    payload: &Value,
) -> Result<Vec<MetricDraft>, NormalizationError> {
    ProviderEvent::parse(provider, kind, payload)?.into_drafts()
}
