//! Connectors module
//!
//! - The [`ConnectionAdapter`] trait every provider implements
//! - Provider identity, metadata, and the adapter registry
//! - The Shopify and Stripe adapters

pub mod metadata;
pub mod registry;
pub mod shopify;
pub mod stripe;
pub mod trait_;

pub use metadata::{AuthType, PaginationStyle, Provider, ProviderMetadata, UnknownProvider};
pub use registry::{Registry, RegistryError};
pub use shopify::ShopifyAdapter;
pub use stripe::StripeAdapter;
pub use trait_::{
    ConnectionAdapter, ConnectionContext, ConnectorError, Cursor, Page, PageRequest, SyncError,
    SyncErrorKind, SyncWindow, WebhookEnvelope, ensure_success,
};
