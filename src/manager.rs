//! Cache Manager Module
//!
//! The only entry point the rest of the application consumes. Selects one
//! configured provider from the registry and exposes a uniform, typed API
//! on top of it: get-or-create, set, remove, tag invalidation, warm-up and
//! statistics.
//!
//! Argument validation happens here, before any provider I/O, so provider
//! implementations stay free of defensive boilerplate.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, warn};

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::events::CacheEvent;
use crate::item::CacheItem;
use crate::provider::{CacheProvider, ProviderRegistry};
use crate::providers::{InMemoryProvider, RedisProvider};
use crate::stats::CacheStatistics;

// == Cache Manager ==
/// Provider-agnostic cache front-end.
///
/// Provider selection is static per manager instance: the configured
/// provider id is looked up among registered providers, and an unknown id
/// silently falls back to the first registered provider so the application
/// always has a working cache.
pub struct CacheManager {
    registry: ProviderRegistry,
    provider: Arc<dyn CacheProvider>,
    default_ttl: u64,
}

impl CacheManager {
    // == Constructors ==
    /// Creates a manager over an explicit registry.
    ///
    /// Fails only when the registry is empty.
    pub fn new(registry: ProviderRegistry, config: &CacheConfig) -> Result<Self> {
        let provider = registry
            .select(&config.default_provider)
            .ok_or_else(|| CacheError::Internal("no cache providers registered".to_string()))?;
        Ok(Self {
            registry,
            provider,
            default_ttl: config.default_ttl,
        })
    }

    /// Creates a manager with the standard pair of providers registered:
    /// "memory" first (the fallback), then "redis".
    pub fn with_default_providers(config: &CacheConfig) -> Result<Self> {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(InMemoryProvider::new(config)));
        registry.register(Arc::new(RedisProvider::new(config)?));
        Self::new(registry, config)
    }

    /// Name of the provider this manager selected.
    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// The selected provider instance.
    pub fn provider(&self) -> &Arc<dyn CacheProvider> {
        &self.provider
    }

    /// Number of registered providers.
    pub fn provider_count(&self) -> usize {
        self.registry.len()
    }

    // == Get Or Create ==
    /// Returns the cached value if present and unexpired; otherwise invokes
    /// `factory`, caches a produced value and returns it.
    ///
    /// A factory error is logged and propagated; nothing is cached. A
    /// factory returning `None` is returned as-is and never cached, which
    /// keeps "not computable" distinguishable from "computed empty".
    pub async fn get_or_create<T, F, Fut>(
        &self,
        key: &str,
        factory: F,
        expiration: Option<Duration>,
        region: Option<&str>,
        tags: &[String],
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        require_non_blank(key, "key")?;
        validate_region(region)?;
        validate_tags(tags)?;

        if let Some(cached) = self.read_typed::<T>(key, region).await? {
            return Ok(Some(cached));
        }

        let produced = match factory().await {
            Ok(produced) => produced,
            Err(err) => {
                error!(key, %err, "cache factory failed");
                return Err(CacheError::Factory(err));
            }
        };

        match produced {
            Some(value) => {
                self.set(key, &value, expiration, region, tags).await?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    // == Get ==
    /// Returns the cached value for `key`, or `None` when absent/expired.
    ///
    /// A present value that cannot be read as `T` is a `TypeMismatch`
    /// error, not a miss.
    pub async fn get<T: DeserializeOwned>(
        &self,
        key: &str,
        region: Option<&str>,
    ) -> Result<Option<T>> {
        require_non_blank(key, "key")?;
        validate_region(region)?;
        self.read_typed(key, region).await
    }

    // == Set ==
    /// Stores a value; returns false (no-op) for values that serialize to
    /// null, since caching "nothing" must not mask a real miss.
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        expiration: Option<Duration>,
        region: Option<&str>,
        tags: &[String],
    ) -> Result<bool> {
        require_non_blank(key, "key")?;
        validate_region(region)?;
        validate_tags(tags)?;

        let payload = serde_json::to_value(value)
            .map_err(|err| CacheError::Serialization(err.to_string()))?;
        if payload.is_null() {
            warn!(key, "refusing to cache null value");
            return Ok(false);
        }

        let item = CacheItem::new(
            key,
            region.map(String::from),
            payload,
            std::any::type_name::<T>(),
            tags.iter().cloned().collect(),
            self.expiry_from(expiration)?,
        );
        self.provider.set(item).await
    }

    // == Remove ==
    /// Removes a key; returns true if it was present.
    pub async fn remove(&self, key: &str, region: Option<&str>) -> Result<bool> {
        require_non_blank(key, "key")?;
        validate_region(region)?;
        self.provider.remove(key, region).await
    }

    // == Exists ==
    /// Returns true if the key is present and not expired.
    pub async fn exists(&self, key: &str, region: Option<&str>) -> Result<bool> {
        require_non_blank(key, "key")?;
        validate_region(region)?;
        self.provider.exists(key, region).await
    }

    // == Clear ==
    /// Wipes one region, or the whole cache when `region` is `None`.
    pub async fn clear(&self, region: Option<&str>) -> Result<bool> {
        validate_region(region)?;
        self.provider.clear(region).await
    }

    // == Remove By Tag ==
    /// Removes every item carrying `tag`; returns the count removed.
    pub async fn remove_by_tag(&self, tag: &str) -> Result<usize> {
        require_non_blank(tag, "tag")?;
        self.provider.remove_by_tag(tag).await
    }

    /// Returns the composite keys of items carrying `tag`.
    pub async fn get_keys_by_tag(&self, tag: &str) -> Result<Vec<String>> {
        require_non_blank(tag, "tag")?;
        self.provider.get_keys_by_tag(tag).await
    }

    // == Get All ==
    /// Returns every unexpired item of a region as a key→value map,
    /// marking each returned item as accessed.
    ///
    /// Items that cannot be read as `T` are logged and skipped.
    pub async fn get_all<T: DeserializeOwned>(
        &self,
        region: &str,
    ) -> Result<HashMap<String, T>> {
        require_non_blank(region, "region")?;

        let items = self.provider.get_all(region).await?;
        let mut values = HashMap::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<T>(item.value) {
                Ok(value) => {
                    values.insert(item.key, value);
                }
                Err(err) => {
                    warn!(key = %item.key, region, %err, "skipping item with unexpected type");
                }
            }
        }
        Ok(values)
    }

    // == Get Keys ==
    /// Returns all keys, or the keys of one region.
    pub async fn get_keys(&self, region: Option<&str>) -> Result<Vec<String>> {
        validate_region(region)?;
        self.provider.get_keys(region).await
    }

    // == Refresh Expiration ==
    /// Extends or resets a key's TTL without rewriting its value.
    ///
    /// No-ops (returns false) for missing or expired keys.
    pub async fn refresh_expiration(
        &self,
        key: &str,
        expiration: Option<Duration>,
        region: Option<&str>,
    ) -> Result<bool> {
        require_non_blank(key, "key")?;
        validate_region(region)?;

        let expires_at = self
            .expiry_from(expiration)?
            .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(self.default_ttl as i64));
        self.provider.refresh_expiration(key, region, expires_at).await
    }

    // == Warmup ==
    /// Bulk-populates the cache from a produced sequence.
    ///
    /// Entries with a blank key (or blank tags) are skipped and logged,
    /// never failed; the whole operation stops only when `factory` itself
    /// fails. Returns the number of entries stored.
    pub async fn warmup<T, F, Fut, K, G>(
        &self,
        factory: F,
        key_selector: K,
        expiration: Option<Duration>,
        region: Option<&str>,
        tag_selector: Option<G>,
    ) -> Result<usize>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Vec<T>>>,
        K: Fn(&T) -> String,
        G: Fn(&T) -> Vec<String>,
    {
        validate_region(region)?;

        let values = match factory().await {
            Ok(values) => values,
            Err(err) => {
                error!(%err, "cache warmup factory failed");
                return Err(CacheError::Factory(err));
            }
        };

        let mut stored = 0;
        for value in &values {
            let key = key_selector(value);
            if key.trim().is_empty() {
                warn!("skipping warmup entry with blank key");
                continue;
            }
            let tags: Vec<String> = tag_selector
                .as_ref()
                .map(|selector| selector(value))
                .unwrap_or_default()
                .into_iter()
                .filter(|tag| {
                    let ok = !tag.trim().is_empty();
                    if !ok {
                        warn!(key = %key, "dropping blank tag on warmup entry");
                    }
                    ok
                })
                .collect();

            if self.set(&key, value, expiration, region, &tags).await? {
                stored += 1;
            }
        }
        Ok(stored)
    }

    // == Statistics ==
    /// Snapshot of the selected provider's statistics block.
    ///
    /// Counters are eventually consistent with the operations that caused
    /// them; a snapshot taken immediately after a write may not reflect it.
    pub async fn statistics(&self) -> CacheStatistics {
        self.provider.statistics().await
    }

    /// Subscribes to the selected provider's lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.provider.subscribe()
    }

    // == Internals ==
    async fn read_typed<T: DeserializeOwned>(
        &self,
        key: &str,
        region: Option<&str>,
    ) -> Result<Option<T>> {
        match self.provider.get(key, region).await? {
            Some(item) => {
                let value =
                    serde_json::from_value(item.value).map_err(|_| CacheError::TypeMismatch {
                        key: key.to_string(),
                        expected: std::any::type_name::<T>(),
                    })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn expiry_from(&self, expiration: Option<Duration>) -> Result<Option<DateTime<Utc>>> {
        expiration
            .map(|duration| {
                let duration = chrono::Duration::from_std(duration).map_err(|_| {
                    CacheError::InvalidArgument("expiration out of range".to_string())
                })?;
                Ok(Utc::now() + duration)
            })
            .transpose()
    }
}

// == Validation ==
fn require_non_blank(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(CacheError::InvalidArgument(format!("{what} cannot be blank")))
    } else {
        Ok(())
    }
}

fn validate_region(region: Option<&str>) -> Result<()> {
    match region {
        Some(region) => require_non_blank(region, "region"),
        None => Ok(()),
    }
}

fn validate_tags(tags: &[String]) -> Result<()> {
    for tag in tags {
        require_non_blank(tag, "tag")?;
    }
    Ok(())
}
