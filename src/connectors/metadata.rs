//! Provider identity and metadata.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Supported commerce/payment providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Shopify,
    Stripe,
}

impl Provider {
    pub const ALL: &'static [Provider] = &[Provider::Shopify, Provider::Stripe];

    pub const fn as_str(self) -> &'static str {
        match self {
            Provider::Shopify => "shopify",
            Provider::Stripe => "stripe",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown provider '{0}'")]
pub struct UnknownProvider(pub String);

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Provider::ALL
            .iter()
            .copied()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownProvider(s.to_string()))
    }
}

/// How a provider authenticates outbound API calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    /// Per-shop access token sent in a provider header
    AccessToken,
    /// Secret API key sent as a bearer token
    SecretKey,
}

/// How an entity's history is paged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PaginationStyle {
    /// Opaque next-page token; ends when the provider reports no further page.
    Cursor,
    /// Lower-bound record id; ends on a short page.
    SinceId,
}

/// Metadata about a provider
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProviderMetadata {
    pub provider: Provider,
    pub auth_type: AuthType,
    pub pagination: PaginationStyle,
    /// Entity types walked by a backfill, in order
    pub entity_types: Vec<String>,
    /// Header carrying the webhook signature
    pub signature_header: String,
}
