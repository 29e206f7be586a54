//! Cache Provider Module
//!
//! The provider trait every backing store implements, plus the explicit
//! registry the manager selects providers from.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::events::CacheEvent;
use crate::item::CacheItem;
use crate::stats::CacheStatistics;

// == Cache Provider Trait ==
/// Operations exposed by one storage medium.
///
/// Implementations own their storage and statistics exclusively; items
/// passed to `set` belong to the provider afterwards. All operations are
/// async; callers cancel by dropping the future, and a remote round trip
/// already in flight completes before cancellation is observed.
#[async_trait]
pub trait CacheProvider: Send + Sync {
    /// Identifier used for registry lookup.
    fn name(&self) -> &str;

    /// Looks up an item; expired items are removed and reported absent.
    async fn get(&self, key: &str, region: Option<&str>) -> Result<Option<CacheItem>>;

    /// Stores an item, replacing any existing entry for the same key.
    ///
    /// Returns false when the item could not be stored.
    async fn set(&self, item: CacheItem) -> Result<bool>;

    /// Removes an item; returns true if it was present.
    async fn remove(&self, key: &str, region: Option<&str>) -> Result<bool>;

    /// Returns true if the key is present and not expired.
    async fn exists(&self, key: &str, region: Option<&str>) -> Result<bool>;

    /// Wipes a region, or everything when region is None.
    async fn clear(&self, region: Option<&str>) -> Result<bool>;

    /// Removes every item carrying the tag; returns the count removed.
    async fn remove_by_tag(&self, tag: &str) -> Result<usize>;

    /// Returns the composite keys of items carrying the tag.
    async fn get_keys_by_tag(&self, tag: &str) -> Result<Vec<String>>;

    /// Returns all keys, or the keys of one region.
    async fn get_keys(&self, region: Option<&str>) -> Result<Vec<String>>;

    /// Returns every unexpired item of a region, marking each as accessed.
    async fn get_all(&self, region: &str) -> Result<Vec<CacheItem>>;

    /// Extends or resets an item's expiration without rewriting its value.
    ///
    /// No-ops (returns false) for missing or expired items.
    async fn refresh_expiration(
        &self,
        key: &str,
        region: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Proactive cleanup pass; returns the number of items removed or pruned.
    async fn perform_maintenance(&self) -> Result<usize>;

    /// Snapshot of the provider's statistics block.
    async fn statistics(&self) -> CacheStatistics;

    /// Subscribes to the provider's lifecycle events.
    fn subscribe(&self) -> broadcast::Receiver<CacheEvent>;
}

// == Provider Registry ==
/// Ordered collection of registered providers with lookup by identifier.
///
/// Lookup of an unknown identifier silently falls back to the first
/// registered provider, so the manager always has a working cache.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn CacheProvider>>,
    by_name: HashMap<String, usize>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    // == Register ==
    /// Adds a provider; a later registration under the same name replaces
    /// the lookup entry but keeps registration order for the fallback.
    pub fn register(&mut self, provider: Arc<dyn CacheProvider>) {
        let name = provider.name().to_string();
        self.by_name.insert(name, self.providers.len());
        self.providers.push(provider);
    }

    // == Select ==
    /// Returns the provider registered under `name`, or the first
    /// registered provider when the name is unknown.
    ///
    /// Returns None only when the registry is empty.
    pub fn select(&self, name: &str) -> Option<Arc<dyn CacheProvider>> {
        self.by_name
            .get(name)
            .and_then(|&idx| self.providers.get(idx))
            .or_else(|| self.providers.first())
            .cloned()
    }

    /// Returns the first registered provider, if any.
    pub fn first(&self) -> Option<Arc<dyn CacheProvider>> {
        self.providers.first().cloned()
    }

    /// Number of registered providers.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Returns true if no providers are registered.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::providers::InMemoryProvider;

    fn memory_provider(name: &str) -> Arc<dyn CacheProvider> {
        Arc::new(InMemoryProvider::with_name(
            name,
            MemoryConfig::default(),
            300,
            false,
        ))
    }

    #[test]
    fn test_registry_empty() {
        let registry = ProviderRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.select("memory").is_none());
        assert!(registry.first().is_none());
    }

    #[tokio::test]
    async fn test_registry_select_by_name() {
        let mut registry = ProviderRegistry::new();
        registry.register(memory_provider("memory"));
        registry.register(memory_provider("redis"));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.select("redis").unwrap().name(), "redis");
        assert_eq!(registry.select("memory").unwrap().name(), "memory");
    }

    #[tokio::test]
    async fn test_registry_unknown_name_falls_back_to_first() {
        let mut registry = ProviderRegistry::new();
        registry.register(memory_provider("memory"));
        registry.register(memory_provider("redis"));

        let selected = registry.select("memcached").unwrap();
        assert_eq!(selected.name(), "memory");
    }
}
