//! Shopify payload shapes and their metric mapping.
//!
//! Shopify sends the resource itself as the webhook body and names the event in the
//! `X-Shopify-Topic` header, so topics and backfill entity types parse the same structs.
//! Money is a decimal string in major units.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::payload::{LifecycleAction, amount_text, typed};
use super::{MetricDraft, MetricType, NormalizationError, parse_decimal};
use crate::connectors::Provider;

/// `financial_status` values that mean money changed hands.
const PAID_STATUSES: &[&str] = &["paid", "partially_refunded", "refunded"];

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ShopifyOrder {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    pub currency: String,
    #[serde(deserialize_with = "amount_text")]
    pub total_price: String,
    #[serde(default)]
    pub financial_status: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub customer: Option<ShopifyCustomerRef>,
    #[serde(default)]
    pub test: bool,
}

impl ShopifyOrder {
    pub fn is_paid(&self) -> bool {
        self.financial_status
            .as_deref()
            .is_some_and(|status| PAID_STATUSES.contains(&status))
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.processed_at.unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ShopifyCustomerRef {
    pub id: u64,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ShopifyRefund {
    pub id: u64,
    pub order_id: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub transactions: Vec<ShopifyTransaction>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ShopifyTransaction {
    #[serde(deserialize_with = "amount_text")]
    pub amount: String,
    #[serde(default)]
    pub currency: Option<String>,
    pub kind: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ShopifyCustomer {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ShopifyRedactRequest {
    pub customer: ShopifyCustomerRef,
    #[serde(default)]
    pub orders_to_redact: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShopifyEvent {
    Order(ShopifyOrder),
    Refund(ShopifyRefund),
    CustomerCreated(ShopifyCustomer),
    AppUninstalled,
    CustomerRedact(ShopifyRedactRequest),
    Unhandled(String),
}

impl ShopifyEvent {
    pub fn parse(kind: &str, payload: &Value) -> Result<Self, NormalizationError> {
        Ok(match kind {
            "orders/create" | "orders/updated" | "orders/paid" | "orders" => {
                Self::Order(typed(kind, payload)?)
            }
            "refunds/create" => Self::Refund(typed(kind, payload)?),
            "customers/create" | "customers" => Self::CustomerCreated(typed(kind, payload)?),
            "app/uninstalled" => Self::AppUninstalled,
            "customers/redact" => Self::CustomerRedact(typed(kind, payload)?),
            other => Self::Unhandled(other.to_string()),
        })
    }

    pub fn lifecycle(&self) -> Option<LifecycleAction> {
        match self {
            Self::AppUninstalled => Some(LifecycleAction::Disconnect),
            Self::CustomerRedact(request) => Some(LifecycleAction::RedactCustomer {
                customer_id: request.customer.id.to_string(),
            }),
            _ => None,
        }
    }

    pub fn into_drafts(self) -> Result<Vec<MetricDraft>, NormalizationError> {
        match self {
            Self::Order(order) => order_drafts(&order),
            Self::Refund(refund) => refund_drafts(&refund),
            Self::CustomerCreated(customer) => Ok(vec![customer_draft(&customer)]),
            Self::AppUninstalled | Self::CustomerRedact(_) | Self::Unhandled(_) => Ok(Vec::new()),
        }
    }
}

fn order_source_id(order_id: u64) -> String {
    format!("shopify:order:{order_id}")
}

/// Every order topic and the backfill share one source id per order, so the count lands once
/// and revenue lands once, on the first delivery that shows the order paid.
fn order_drafts(order: &ShopifyOrder) -> Result<Vec<MetricDraft>, NormalizationError> {
    let source_id = order_source_id(order.id);
    let customer_id = order.customer.as_ref().map(|c| c.id.to_string());
    let email = order
        .email
        .clone()
        .or_else(|| order.customer.as_ref().and_then(|c| c.email.clone()));

    let annotate = |draft: MetricDraft| {
        draft
            .with_meta("order_id", Some(order.id))
            .with_meta("order_name", order.name.clone())
            .with_meta("financial_status", order.financial_status.clone())
            .with_meta("customer_id", customer_id.clone())
            .with_meta("email", email.clone())
            .with_meta("test", order.test.then_some(true))
    };

    let mut drafts = vec![annotate(MetricDraft::count(
        Provider::Shopify,
        MetricType::Orders,
        source_id.clone(),
        order.created_at,
    ))];

    if order.is_paid() {
        let total = parse_decimal("total_price", &order.total_price)?;
        drafts.push(annotate(
            MetricDraft::new(
                Provider::Shopify,
                MetricType::Revenue,
                total,
                source_id,
                order.occurred_at(),
            )
            .with_currency(&order.currency),
        ));
    }

    Ok(drafts)
}

fn refund_drafts(refund: &ShopifyRefund) -> Result<Vec<MetricDraft>, NormalizationError> {
    let mut total = 0.0;
    let mut currency = None;
    for transaction in refund.transactions.iter().filter(|t| {
        t.kind == "refund" && t.status.as_deref().is_none_or(|s| s == "success")
    }) {
        total += parse_decimal("transactions.amount", &transaction.amount)?;
        if currency.is_none() {
            currency = transaction.currency.clone();
        }
    }

    if total == 0.0 {
        return Ok(Vec::new());
    }

    let mut draft = MetricDraft::new(
        Provider::Shopify,
        MetricType::Refunds,
        total,
        format!("shopify:refund:{}", refund.id),
        refund.created_at,
    )
    .with_meta("refund_id", Some(refund.id))
    .with_meta("order_id", Some(refund.order_id));
    if let Some(currency) = currency {
        draft = draft.with_currency(&currency);
    }
    Ok(vec![draft])
}

fn customer_draft(customer: &ShopifyCustomer) -> MetricDraft {
    MetricDraft::count(
        Provider::Shopify,
        MetricType::Customers,
        format!("shopify:customer:{}", customer.id),
        customer.created_at,
    )
    .with_meta("customer_id", Some(customer.id.to_string()))
    .with_meta("email", customer.email.clone())
}
