//! Typed provider payloads.
//!
//! [`ProviderEvent`] is the discriminated union over `(provider, kind)`. Parsing validates the
//! minimal set of required fields for the variant; mapping to drafts only ever sees typed data.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use super::shopify::ShopifyEvent;
use super::stripe::StripeEvent;
use super::{MetricDraft, NormalizationError};
use crate::connectors::Provider;

/// Side effects an event has on the connection itself, beyond metric records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleAction {
    /// The merchant removed the app; the credential is void.
    Disconnect,
    /// Scrub personal data for one customer from stored metadata.
    RedactCustomer { customer_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Shopify(ShopifyEvent),
    Stripe(StripeEvent),
}

impl ProviderEvent {
    pub fn parse(provider: Provider, kind: &str, payload: &Value) -> Result<Self, NormalizationError> {
        match provider {
            Provider::Shopify => ShopifyEvent::parse(kind, payload).map(Self::Shopify),
            Provider::Stripe => StripeEvent::parse(kind, payload).map(Self::Stripe),
        }
    }

    pub fn provider(&self) -> Provider {
        match self {
            Self::Shopify(_) => Provider::Shopify,
            Self::Stripe(_) => Provider::Stripe,
        }
    }

    /// False for kinds that are acknowledged but intentionally not mapped.
    pub fn is_handled(&self) -> bool {
        match self {
            Self::Shopify(event) => !matches!(event, ShopifyEvent::Unhandled(_)),
            Self::Stripe(event) => !matches!(event, StripeEvent::Unhandled(_)),
        }
    }

    pub fn lifecycle(&self) -> Option<LifecycleAction> {
        match self {
            Self::Shopify(event) => event.lifecycle(),
            Self::Stripe(_) => None,
        }
    }

    pub fn into_drafts(self) -> Result<Vec<MetricDraft>, NormalizationError> {
        match self {
            Self::Shopify(event) => event.into_drafts(),
            Self::Stripe(event) => event.into_drafts(),
        }
    }
}

/// Deserialize `T` from a borrowed payload, naming `kind` on failure.
pub(crate) fn typed<'a, T: Deserialize<'a>>(kind: &str, payload: &'a Value) -> Result<T, NormalizationError> {
    T::deserialize(payload).map_err(|e| NormalizationError::malformed(kind, e))
}

/// Money fields arrive as `"12.50"` from Shopify but occasionally as bare numbers.
pub(crate) fn amount_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    })
}

/// An id that may be a bare string or an expanded object with an `id` field.
pub(crate) fn expandable_id<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::String(id)) => Some(id),
        Some(Value::Object(map)) => map.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Sample {
        #[serde(deserialize_with = "amount_text")]
        amount: String,
        #[serde(default, deserialize_with = "expandable_id")]
        customer: Option<String>,
    }

    #[test]
    fn amounts_accept_strings_and_numbers() {
        let a: Sample = typed("sample", &json!({"amount": "10.50"})).unwrap();
        let b: Sample = typed("sample", &json!({"amount": 10.5})).unwrap();
        assert_eq!(a.amount, "10.50");
        assert_eq!(b.amount, "10.5");
    }

    #[test]
    fn expandable_ids_accept_both_shapes() {
        let plain: Sample = typed("sample", &json!({"amount": "1", "customer": "cus_1"})).unwrap();
        let expanded: Sample =
            typed("sample", &json!({"amount": "1", "customer": {"id": "cus_2"}})).unwrap();
        let null: Sample = typed("sample", &json!({"amount": "1", "customer": null})).unwrap();
        assert_eq!(plain.customer.as_deref(), Some("cus_1"));
        assert_eq!(expanded.customer.as_deref(), Some("cus_2"));
        assert_eq!(null.customer, None);
    }

    #[test]
    fn missing_required_field_names_the_kind() {
        let err = typed::<Sample>("orders/paid", &json!({})).unwrap_err();
        match err {
            NormalizationError::Malformed { kind, reason } => {
                assert_eq!(kind, "orders/paid");
                assert!(reason.contains("amount"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn dispatches_on_provider() {
        let event = ProviderEvent::parse(Provider::Shopify, "app/uninstalled", &json!({})).unwrap();
        assert_eq!(event.provider(), Provider::Shopify);
        assert!(event.is_handled());
        assert_eq!(event.lifecycle(), Some(LifecycleAction::Disconnect));

        let unhandled = ProviderEvent::parse(Provider::Stripe, "plan.created", &json!({
            "id": "evt_1", "type": "plan.created", "created": 1, "data": {"object": {}}
        }))
        .unwrap();
        assert!(!unhandled.is_handled());
        assert!(unhandled.into_drafts().unwrap().is_empty());
    }
}
