//! Stripe payload shapes and their metric mapping.
//!
//! Webhook kinds (`charge.succeeded`) arrive wrapped in an event envelope whose
//! `data.object` is the resource; backfill entity kinds (`charges`) are the bare resource.
//! Amounts are integers in the currency's minor unit.
//!
//! Refunds are always recorded per refund object under `stripe:refund:{id}`. A charge only
//! carries its refund list when Stripe embeds it, so the `refunds` entity and the `refund.*`
//! events are the paths that see every refund; all of them land on the same key.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::payload::{expandable_id, typed};
use super::{MetricDraft, MetricType, NormalizationError, minor_to_major, timestamp_from_unix};
use crate::connectors::Provider;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StripeEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub created: i64,
    pub data: StripeEnvelopeData,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StripeEnvelopeData {
    pub object: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StripeList<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StripeCharge {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub created: i64,
    pub status: String,
    #[serde(default)]
    pub paid: bool,
    #[serde(default, deserialize_with = "expandable_id")]
    pub invoice: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default)]
    pub refunds: Option<StripeList<StripeRefund>>,
}

impl StripeCharge {
    fn succeeded(&self) -> bool {
        self.status == "succeeded" && self.paid
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StripeRefund {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub created: i64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub charge: Option<String>,
}

impl StripeRefund {
    fn succeeded(&self) -> bool {
        self.status.as_deref().is_none_or(|s| s == "succeeded")
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StripeInvoice {
    pub id: String,
    pub amount_paid: i64,
    pub currency: String,
    pub created: i64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
    #[serde(default)]
    pub status_transitions: Option<StripeStatusTransitions>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StripeStatusTransitions {
    #[serde(default)]
    pub paid_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StripeCustomer {
    pub id: String,
    pub created: i64,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StripeSubscription {
    pub id: String,
    pub status: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
    Created,
    Updated,
    Deleted,
}

impl SubscriptionAction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StripeEvent {
    /// `charge.succeeded`, `charge.refunded`, or a backfilled charge.
    Charge(StripeCharge),
    /// `refund.created`, `refund.updated`, `charge.refund.updated`, or a backfilled refund.
    Refund(StripeRefund),
    /// `invoice.paid`, `invoice.payment_succeeded`, or a backfilled invoice.
    Invoice(StripeInvoice),
    /// `customer.created` or a backfilled customer.
    Customer(StripeCustomer),
    Subscription {
        event_id: String,
        occurred: i64,
        action: SubscriptionAction,
        subscription: StripeSubscription,
    },
    Unhandled(String),
}

impl StripeEvent {
    pub fn parse(kind: &str, payload: &Value) -> Result<Self, NormalizationError> {
        match kind {
            "charges" => return Ok(Self::Charge(typed(kind, payload)?)),
            "refunds" => return Ok(Self::Refund(typed(kind, payload)?)),
            "invoices" => return Ok(Self::Invoice(typed(kind, payload)?)),
            "customers" => return Ok(Self::Customer(typed(kind, payload)?)),
            _ => {}
        }

        let envelope: StripeEnvelope = typed(kind, payload)?;
        if envelope.kind != kind {
            return Err(NormalizationError::malformed(
                kind,
                format!("event type is {}", envelope.kind),
            ));
        }
        let object = &envelope.data.object;

        Ok(match kind {
            "charge.succeeded" | "charge.refunded" => Self::Charge(typed(kind, object)?),
            "refund.created" | "refund.updated" | "charge.refund.updated" => {
                Self::Refund(typed(kind, object)?)
            }
            "invoice.paid" | "invoice.payment_succeeded" => Self::Invoice(typed(kind, object)?),
            "customer.created" => Self::Customer(typed(kind, object)?),
            "customer.subscription.created"
            | "customer.subscription.updated"
            | "customer.subscription.deleted" => {
                let action = match kind.rsplit('.').next() {
                    Some("created") => SubscriptionAction::Created,
                    Some("deleted") => SubscriptionAction::Deleted,
                    _ => SubscriptionAction::Updated,
                };
                Self::Subscription {
                    event_id: envelope.id.clone(),
                    occurred: envelope.created,
                    action,
                    subscription: typed(kind, object)?,
                }
            }
            other => Self::Unhandled(other.to_string()),
        })
    }

    pub fn into_drafts(self) -> Result<Vec<MetricDraft>, NormalizationError> {
        match self {
            Self::Charge(charge) => charge_drafts(&charge),
            Self::Refund(refund) if refund.succeeded() => Ok(vec![refund_draft(&refund)?]),
            Self::Refund(_) => Ok(Vec::new()),
            Self::Invoice(invoice) => invoice_drafts(&invoice),
            Self::Customer(customer) => Ok(vec![customer_draft(&customer)?]),
            Self::Subscription {
                event_id,
                occurred,
                action,
                subscription,
            } => Ok(vec![subscription_draft(
                &event_id,
                occurred,
                action,
                &subscription,
            )?]),
            Self::Unhandled(_) => Ok(Vec::new()),
        }
    }
}

/// Revenue for a standalone successful charge plus one record per embedded successful refund.
/// Invoice charges are left to the invoice so the same money is not counted twice.
fn charge_drafts(charge: &StripeCharge) -> Result<Vec<MetricDraft>, NormalizationError> {
    let mut drafts = Vec::new();

    if charge.succeeded() && charge.invoice.is_none() {
        drafts.push(
            MetricDraft::new(
                Provider::Stripe,
                MetricType::Revenue,
                minor_to_major(charge.amount, &charge.currency),
                format!("stripe:charge:{}", charge.id),
                timestamp_from_unix("created", charge.created)?,
            )
            .with_currency(&charge.currency)
            .with_meta("charge_id", Some(charge.id.clone()))
            .with_meta("customer_id", charge.customer.clone()),
        );
    }

    // The charge's running `amount_refunded` is never recorded: its value changes under a
    // fixed id. Refunds not embedded here arrive through the refunds entity or `refund.*`.
    for refund in charge.refunds.iter().flat_map(|list| &list.data) {
        if refund.succeeded() {
            let mut refund = refund.clone();
            refund.charge.get_or_insert_with(|| charge.id.clone());
            drafts.push(refund_draft(&refund)?);
        }
    }

    Ok(drafts)
}

fn refund_draft(refund: &StripeRefund) -> Result<MetricDraft, NormalizationError> {
    Ok(MetricDraft::new(
        Provider::Stripe,
        MetricType::Refunds,
        minor_to_major(refund.amount, &refund.currency),
        format!("stripe:refund:{}", refund.id),
        timestamp_from_unix("refunds.created", refund.created)?,
    )
    .with_currency(&refund.currency)
    .with_meta("refund_id", Some(refund.id.clone()))
    .with_meta("charge_id", refund.charge.clone()))
}

fn invoice_drafts(invoice: &StripeInvoice) -> Result<Vec<MetricDraft>, NormalizationError> {
    if invoice.status.as_deref() != Some("paid") || invoice.amount_paid <= 0 {
        return Ok(Vec::new());
    }
    let paid_at = invoice
        .status_transitions
        .as_ref()
        .and_then(|t| t.paid_at)
        .unwrap_or(invoice.created);

    Ok(vec![
        MetricDraft::new(
            Provider::Stripe,
            MetricType::Revenue,
            minor_to_major(invoice.amount_paid, &invoice.currency),
            format!("stripe:invoice:{}", invoice.id),
            timestamp_from_unix("status_transitions.paid_at", paid_at)?,
        )
        .with_currency(&invoice.currency)
        .with_meta("invoice_id", Some(invoice.id.clone()))
        .with_meta("customer_id", invoice.customer.clone())
        .with_meta("subscription_id", invoice.subscription.clone()),
    ])
}

fn customer_draft(customer: &StripeCustomer) -> Result<MetricDraft, NormalizationError> {
    Ok(MetricDraft::count(
        Provider::Stripe,
        MetricType::Customers,
        format!("stripe:customer:{}", customer.id),
        timestamp_from_unix("created", customer.created)?,
    )
    .with_meta("customer_id", Some(customer.id.clone()))
    .with_meta("email", customer.email.clone()))
}

fn subscription_draft(
    event_id: &str,
    occurred: i64,
    action: SubscriptionAction,
    subscription: &StripeSubscription,
) -> Result<MetricDraft, NormalizationError> {
    let occurred_at: DateTime<Utc> = timestamp_from_unix("created", occurred)?;
    Ok(MetricDraft::count(
        Provider::Stripe,
        MetricType::SubscriptionEvents,
        format!("stripe:event:{event_id}"),
        occurred_at,
    )
    .with_meta("action", Some(action.as_str()))
    .with_meta("subscription_id", Some(subscription.id.clone()))
    .with_meta("status", Some(subscription.status.clone()))
    .with_meta("customer_id", subscription.customer.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: &str, object: Value) -> Value {
        json!({
            "id": "evt_1NG8Du2eZvKYlo2CUI79vXWy",
            "object": "event",
            "type": kind,
            "created": 1_760_000_000,
            "data": {"object": object}
        })
    }

    fn charge(amount: i64, currency: &str) -> Value {
        json!({
            "id": "ch_3MmlLrLkdIwHu7ix0snN0B15",
            "object": "charge",
            "amount": amount,
            "amount_refunded": 0,
            "currency": currency,
            "created": 1_759_999_000,
            "status": "succeeded",
            "paid": true,
            "invoice": null,
            "customer": "cus_9s6XKzkNRiz8i3"
        })
    }

    #[test]
    fn charge_of_12345_usd_is_123_45() {
        let drafts = StripeEvent::parse("charge.succeeded", &event("charge.succeeded", charge(12345, "usd")))
            .unwrap()
            .into_drafts()
            .unwrap();

        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].metric_type, MetricType::Revenue);
        assert_eq!(drafts[0].value, 123.45);
        assert_eq!(drafts[0].currency.as_deref(), Some("USD"));
        assert_eq!(
            drafts[0].source_event_id,
            "stripe:charge:ch_3MmlLrLkdIwHu7ix0snN0B15"
        );
    }

    #[test]
    fn zero_decimal_charge_is_not_divided() {
        let drafts = StripeEvent::parse("charges", &charge(5000, "jpy"))
            .unwrap()
            .into_drafts()
            .unwrap();
        assert_eq!(drafts[0].value, 5000.0);
    }

    #[test]
    fn invoice_charge_defers_to_the_invoice() {
        let mut object = charge(2000, "usd");
        object["invoice"] = json!("in_1");
        let drafts = StripeEvent::parse("charge.succeeded", &event("charge.succeeded", object))
            .unwrap()
            .into_drafts()
            .unwrap();
        assert!(drafts.is_empty());
    }

    #[test]
    fn failed_charge_earns_nothing() {
        let mut object = charge(2000, "usd");
        object["status"] = json!("failed");
        object["paid"] = json!(false);
        let drafts = StripeEvent::parse("charges", &object).unwrap().into_drafts().unwrap();
        assert!(drafts.is_empty());
    }

    #[test]
    fn refunded_charge_yields_one_record_per_refund() {
        let mut object = charge(5000, "usd");
        object["amount_refunded"] = json!(3000);
        object["refunds"] = json!({
            "object": "list",
            "has_more": false,
            "data": [
                {"id": "re_1", "amount": 1000, "currency": "usd", "created": 1_760_000_100, "status": "succeeded"},
                {"id": "re_2", "amount": 2000, "currency": "usd", "created": 1_760_000_200, "status": "succeeded"},
                {"id": "re_3", "amount": 900, "currency": "usd", "created": 1_760_000_300, "status": "failed"}
            ]
        });
        let drafts = StripeEvent::parse("charge.refunded", &event("charge.refunded", object))
            .unwrap()
            .into_drafts()
            .unwrap();

        let refunds: Vec<_> = drafts
            .iter()
            .filter(|d| d.metric_type == MetricType::Refunds)
            .collect();
        assert_eq!(refunds.len(), 2);
        assert_eq!(refunds[0].source_event_id, "stripe:refund:re_1");
        assert_eq!(refunds[1].value, 20.0);
        // Gross revenue for the charge is still reported under its own key.
        assert!(drafts.iter().any(|d| d.metric_type == MetricType::Revenue));
    }

    fn refund_keys(drafts: &[MetricDraft]) -> Vec<(String, f64)> {
        drafts
            .iter()
            .filter(|d| d.metric_type == MetricType::Refunds)
            .map(|d| (d.source_event_id.clone(), d.value))
            .collect()
    }

    #[test]
    fn refunded_total_without_refund_list_records_nothing() {
        // Growing totals under one key would keep only the first value.
        for refunded in [1000, 3000] {
            let mut object = charge(5000, "usd");
            object["amount_refunded"] = json!(refunded);
            let drafts = StripeEvent::parse("charge.refunded", &event("charge.refunded", object))
                .unwrap()
                .into_drafts()
                .unwrap();
            assert!(refund_keys(&drafts).is_empty());
            assert_eq!(drafts.len(), 1);
        }
    }

    #[test]
    fn charge_with_and_without_refund_list_shares_refund_keys() {
        let mut bare = charge(5000, "usd");
        bare["amount_refunded"] = json!(3000);
        let mut expanded = bare.clone();
        expanded["refunds"] = json!({"data": [
            {"id": "re_1", "amount": 1000, "currency": "usd", "created": 1_760_000_100, "status": "succeeded"},
            {"id": "re_2", "amount": 2000, "currency": "usd", "created": 1_760_000_200, "status": "succeeded"}
        ]});

        let mut keys = refund_keys(&StripeEvent::parse("charges", &bare).unwrap().into_drafts().unwrap());
        keys.extend(refund_keys(
            &StripeEvent::parse("charges", &expanded).unwrap().into_drafts().unwrap(),
        ));
        for (id, amount) in [("re_1", 1000), ("re_2", 2000)] {
            let refund = json!({
                "id": id, "object": "refund", "amount": amount, "currency": "usd",
                "created": 1_760_000_100, "status": "succeeded",
                "charge": "ch_3MmlLrLkdIwHu7ix0snN0B15"
            });
            keys.extend(refund_keys(
                &StripeEvent::parse("refund.created", &event("refund.created", refund.clone()))
                    .unwrap()
                    .into_drafts()
                    .unwrap(),
            ));
            keys.extend(refund_keys(&StripeEvent::parse("refunds", &refund).unwrap().into_drafts().unwrap()));
        }

        let mut distinct: std::collections::BTreeMap<String, f64> = Default::default();
        for (key, value) in keys {
            assert_eq!(*distinct.entry(key).or_insert(value), value);
        }
        assert_eq!(
            distinct.keys().cloned().collect::<Vec<_>>(),
            vec!["stripe:refund:re_1", "stripe:refund:re_2"]
        );
        assert_eq!(distinct.values().sum::<f64>(), 30.0);
    }

    #[test]
    fn refund_objects_map_to_refund_records() {
        let refund = json!({
            "id": "re_9", "object": "refund", "amount": 250, "currency": "eur",
            "created": 1_760_000_500, "status": "succeeded", "charge": {"id": "ch_9"}
        });
        let drafts = StripeEvent::parse("refunds", &refund).unwrap().into_drafts().unwrap();
        assert_eq!(drafts[0].value, 2.5);
        assert_eq!(drafts[0].metadata["charge_id"], "ch_9");

        let mut pending = refund;
        pending["status"] = json!("pending");
        let drafts = StripeEvent::parse("refund.updated", &event("refund.updated", pending))
            .unwrap()
            .into_drafts()
            .unwrap();
        assert!(drafts.is_empty());
    }

    #[test]
    fn paid_invoice_is_revenue_at_paid_time() {
        let invoice = json!({
            "id": "in_1MtHbELkdIwHu7ixl4OzzPMv",
            "amount_paid": 9900,
            "currency": "eur",
            "created": 1_759_000_000,
            "status": "paid",
            "customer": "cus_1",
            "subscription": "sub_1",
            "status_transitions": {"paid_at": 1_759_000_600}
        });
        let drafts = StripeEvent::parse("invoice.paid", &event("invoice.paid", invoice.clone()))
            .unwrap()
            .into_drafts()
            .unwrap();
        assert_eq!(drafts[0].value, 99.0);
        assert_eq!(drafts[0].occurred_at.timestamp(), 1_759_000_600);
        assert_eq!(drafts[0].metadata["subscription_id"], "sub_1");

        let mut open = invoice;
        open["status"] = json!("open");
        assert!(StripeEvent::parse("invoices", &open).unwrap().into_drafts().unwrap().is_empty());
    }

    #[test]
    fn subscription_events_key_on_the_event_id() {
        let sub = json!({"id": "sub_1", "status": "active", "customer": "cus_1"});
        let drafts = StripeEvent::parse(
            "customer.subscription.updated",
            &event("customer.subscription.updated", sub),
        )
        .unwrap()
        .into_drafts()
        .unwrap();
        assert_eq!(drafts[0].metric_type, MetricType::SubscriptionEvents);
        assert_eq!(
            drafts[0].source_event_id,
            "stripe:event:evt_1NG8Du2eZvKYlo2CUI79vXWy"
        );
        assert_eq!(drafts[0].metadata["action"], "updated");
    }

    #[test]
    fn envelope_type_must_match_kind() {
        let payload = event("charge.failed", charge(100, "usd"));
        assert!(matches!(
            StripeEvent::parse("charge.succeeded", &payload),
            Err(NormalizationError::Malformed { .. })
        ));
    }

    #[test]
    fn event_missing_data_object_is_malformed() {
        let payload = json!({"id": "evt_1", "type": "charge.succeeded", "created": 1});
        assert!(StripeEvent::parse("charge.succeeded", &payload).is_err());
    }
}
