//! Adapter registry
//!
//! Maps each [`Provider`] to its hand-written adapter. Built once at startup from config and
//! shared through application state.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::connectors::{
    ConnectionAdapter, Provider, ProviderMetadata, ShopifyAdapter, StripeAdapter,
};

/// Error type for registry operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("Provider '{name}' not found")]
    ProviderNotFound { name: String },
}

#[derive(Clone, Default)]
pub struct Registry {
    adapters: HashMap<Provider, Arc<dyn ConnectionAdapter>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in adapter configured from `config`.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ShopifyAdapter::from_config(config)));
        registry.register(Arc::new(StripeAdapter::from_config(config)));
        registry
    }

    /// Register an adapter, replacing any previous one for the same provider.
    pub fn register(&mut self, adapter: Arc<dyn ConnectionAdapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn get(&self, provider: Provider) -> Result<Arc<dyn ConnectionAdapter>, RegistryError> {
        self.adapters
            .get(&provider)
            .cloned()
            .ok_or_else(|| RegistryError::ProviderNotFound {
                name: provider.to_string(),
            })
    }

    /// Look up by slug, as found in URLs and the `connections.provider` column.
    pub fn get_by_name(&self, name: &str) -> Result<Arc<dyn ConnectionAdapter>, RegistryError> {
        let provider = name
            .parse::<Provider>()
            .map_err(|_| RegistryError::ProviderNotFound {
                name: name.to_string(),
            })?;
        self.get(provider)
    }

    /// Metadata for all providers, sorted by provider for stable ordering
    pub fn list_metadata(&self) -> Vec<ProviderMetadata> {
        let mut metadata: Vec<_> = self.adapters.values().map(|a| a.metadata()).collect();
        metadata.sort_by_key(|m| m.provider);
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_registers_both_providers() {
        let registry = Registry::from_config(&AppConfig::default());
        assert!(registry.get(Provider::Shopify).is_ok());
        assert_eq!(
            registry.get_by_name("STRIPE").unwrap().provider(),
            Provider::Stripe
        );

        let providers: Vec<_> = registry
            .list_metadata()
            .into_iter()
            .map(|m| m.provider)
            .collect();
        assert_eq!(providers, vec![Provider::Shopify, Provider::Stripe]);
    }

    #[test]
    fn unknown_names_are_not_found() {
        let registry = Registry::new();
        assert!(matches!(
            registry.get_by_name("paypal"),
            Err(RegistryError::ProviderNotFound { .. })
        ));
        assert!(registry.get(Provider::Shopify).is_err());
    }
}
