//! Redis Provider Module
//!
//! Delegates storage to a Redis backend. This provider's job is protocol
//! translation and consistency bookkeeping: the whole `CacheItem` travels
//! serialized so access telemetry survives round trips, Redis TTLs perform
//! expiration, and per-tag sets form the invalidation index.
//!
//! After the connection is established, every transport or serialization
//! failure is caught, logged and converted to the operation's "nothing
//! happened" result; callers cannot distinguish a miss from a backend
//! outage and must treat both as a miss.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError};
use tokio::sync::{broadcast, Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::config::{CacheConfig, RedisConfig};
use crate::error::{CacheError, Result};
use crate::events::{CacheEvent, RemovalReason};
use crate::item::{composite_key, CacheItem};
use crate::provider::CacheProvider;
use crate::stats::CacheStatistics;

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Namespace segment for tag index sets.
const TAG_SEGMENT: &str = "tag:";

// == Redis Provider ==
/// Cache provider backed by a networked Redis instance.
///
/// The connection is a lazily-initialized shared multiplexed connection:
/// opened on first use with the configured retry budget and reused
/// thereafter. Initialization failure is fatal for this provider and is
/// raised on first access instead of being degraded.
pub struct RedisProvider {
    name: String,
    client: Client,
    conn: OnceCell<MultiplexedConnection>,
    config: RedisConfig,
    default_ttl: u64,
    track_sizes: bool,
    stats: Mutex<CacheStatistics>,
    events: broadcast::Sender<CacheEvent>,
}

impl RedisProvider {
    // == Constructors ==
    /// Creates a provider named "redis" from the cache configuration.
    ///
    /// Fails only when the connection URL cannot be parsed; the actual
    /// connection is opened lazily on first use.
    pub fn new(config: &CacheConfig) -> Result<Self> {
        Self::with_name("redis", config.redis.clone(), config.default_ttl, config.track_sizes)
    }

    /// Creates a provider with an explicit name and settings.
    pub fn with_name(
        name: &str,
        config: RedisConfig,
        default_ttl: u64,
        track_sizes: bool,
    ) -> Result<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|err| CacheError::Connection(format!("invalid redis url: {err}")))?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            name: name.to_string(),
            client,
            conn: OnceCell::new(),
            config,
            default_ttl,
            track_sizes,
            stats: Mutex::new(CacheStatistics::new()),
            events,
        })
    }

    // == Connection ==
    /// Returns the shared connection, opening it on first use.
    ///
    /// Retries up to the configured attempt count with the configured
    /// delay; exhausting the budget is a fatal `Connection` error.
    async fn connection(&self) -> Result<MultiplexedConnection> {
        self.conn
            .get_or_try_init(|| async {
                let mut attempt = 0u32;
                loop {
                    attempt += 1;
                    match self.client.get_multiplexed_async_connection().await {
                        Ok(mut conn) => {
                            if self.config.database != 0 {
                                let selected: std::result::Result<(), RedisError> = redis::cmd("SELECT")
                                    .arg(self.config.database)
                                    .query_async(&mut conn)
                                    .await;
                                selected.map_err(|err| {
                                        CacheError::Connection(format!(
                                            "redis SELECT {} failed: {err}",
                                            self.config.database
                                        ))
                                    })?;
                            }
                            info!(url = %self.config.url, "redis connection established");
                            return Ok(conn);
                        }
                        Err(err) if attempt <= self.config.connect_retries => {
                            warn!(attempt, %err, "redis connection attempt failed, retrying");
                            tokio::time::sleep(std::time::Duration::from_millis(
                                self.config.retry_delay_ms,
                            ))
                            .await;
                        }
                        Err(err) => {
                            return Err(CacheError::Connection(format!(
                                "redis connection failed after {attempt} attempts: {err}"
                            )));
                        }
                    }
                }
            })
            .await
            .cloned()
    }

    // == Key Layout ==
    /// Storage key for an item: `prefix + region + ":" + key` or `prefix + key`.
    fn storage_key(&self, key: &str, region: Option<&str>) -> String {
        format!("{}{}", self.config.key_prefix, composite_key(key, region))
    }

    /// Key of a tag's index set: `prefix + "tag:" + tag`.
    fn tag_key(&self, tag: &str) -> String {
        format!("{}{}{}", self.config.key_prefix, TAG_SEGMENT, tag)
    }

    fn publish(&self, event: CacheEvent) {
        // No subscribers is fine; events are one-way
        let _ = self.events.send(event);
    }

    async fn note_hit(&self, region: Option<&str>) {
        self.stats.lock().await.record_hit(region);
    }

    async fn note_miss(&self, region: Option<&str>) {
        self.stats.lock().await.record_miss(region);
    }

    async fn note_added(&self, region: Option<&str>, size: Option<u64>) {
        self.stats.lock().await.record_item_added(region, size);
    }

    async fn note_removed(&self, region: Option<&str>, size: Option<u64>) {
        self.stats.lock().await.record_item_removed(region, size);
    }

    /// Fetches and deserializes an item; a payload that cannot be
    /// deserialized is deleted best-effort and treated as absent.
    async fn fetch_item(
        &self,
        conn: &mut MultiplexedConnection,
        skey: &str,
    ) -> std::result::Result<Option<CacheItem>, RedisError> {
        let raw: Option<String> = conn.get(skey).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        match serde_json::from_str::<CacheItem>(&raw) {
            Ok(item) => Ok(Some(item)),
            Err(err) => {
                warn!(key = skey, %err, "undeserializable cache payload, dropping");
                let _: i64 = conn.del(skey).await.unwrap_or(0);
                Ok(None)
            }
        }
    }

    /// Writes an item back with its remaining TTL.
    async fn write_item(
        &self,
        conn: &mut MultiplexedConnection,
        skey: &str,
        item: &CacheItem,
    ) -> std::result::Result<bool, RedisError> {
        let payload = match serde_json::to_string(item) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(key = %item.key, %err, "item serialization failed, not cached");
                return Ok(false);
            }
        };
        match item.ttl_remaining() {
            Some(ttl) => {
                let secs = ttl.num_seconds().max(1) as u64;
                let _: () = conn.set_ex(skey, payload, secs).await?;
            }
            None => {
                let _: () = conn.set(skey, payload).await?;
            }
        }
        Ok(true)
    }

    /// Removes `member` from every tag set in `tags` except `keep`.
    ///
    /// Keeps tag indexes free of stale members when an item leaves the
    /// cache through any path.
    async fn reconcile_tags(
        &self,
        conn: &mut MultiplexedConnection,
        tags: &HashSet<String>,
        member: &str,
        keep: Option<&str>,
    ) {
        for tag in tags {
            if Some(tag.as_str()) == keep {
                continue;
            }
            let tag_key = self.tag_key(tag);
            if let Err(err) = conn.srem::<_, _, i64>(&tag_key, member).await {
                warn!(tag = %tag, %err, "tag index cleanup failed");
            }
        }
    }

    /// Scans all keys matching the pattern.
    async fn scan_keys(
        &self,
        conn: &mut MultiplexedConnection,
        pattern: &str,
    ) -> std::result::Result<Vec<String>, RedisError> {
        let mut keys = Vec::new();
        let mut iter = conn.scan_match::<_, String>(pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }
}

#[async_trait::async_trait]
impl CacheProvider for RedisProvider {
    fn name(&self) -> &str {
        &self.name
    }

    // == Get ==
    async fn get(&self, key: &str, region: Option<&str>) -> Result<Option<CacheItem>> {
        let mut conn = self.connection().await?;
        let skey = self.storage_key(key, region);

        let fetched = match self.fetch_item(&mut conn, &skey).await {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(key, %err, "redis get failed, treating as miss");
                None
            }
        };

        let Some(mut item) = fetched else {
            self.note_miss(region).await;
            self.publish(CacheEvent::ItemAccessed {
                key: key.to_string(),
                region: region.map(String::from),
                hit: false,
            });
            return Ok(None);
        };

        if item.is_expired() {
            // Backend TTL normally handles this; delete defensively anyway
            if let Err(err) = conn.del::<_, i64>(&skey).await {
                warn!(key, %err, "failed to delete expired item");
            }
            self.reconcile_tags(&mut conn, &item.tags, &item.composite_key(), None)
                .await;
            self.note_removed(region, item.size_in_bytes).await;
            self.note_miss(region).await;
            self.publish(CacheEvent::ItemRemoved {
                key: item.key,
                region: item.region,
                reason: RemovalReason::Expired,
            });
            self.publish(CacheEvent::ItemAccessed {
                key: key.to_string(),
                region: region.map(String::from),
                hit: false,
            });
            return Ok(None);
        }

        // A hit costs one extra write: access telemetry rides back to the
        // store with the remaining TTL preserved
        item.mark_accessed();
        if let Err(err) = self.write_item(&mut conn, &skey, &item).await {
            warn!(key, %err, "access-time write-back failed");
        }

        self.note_hit(region).await;
        self.publish(CacheEvent::ItemAccessed {
            key: key.to_string(),
            region: region.map(String::from),
            hit: true,
        });
        Ok(Some(item))
    }

    // == Set ==
    async fn set(&self, mut item: CacheItem) -> Result<bool> {
        let mut conn = self.connection().await?;

        if item.expires_at.is_none() {
            item.expires_at = Some(Utc::now() + Duration::seconds(self.default_ttl as i64));
        }
        // An item that is already past its expiration has no storable TTL
        if item.is_expired() {
            return Ok(false);
        }

        if self.track_sizes {
            item.size_in_bytes = item.estimate_size();
        }

        let skey = self.storage_key(&item.key, item.region.as_deref());
        let composite = item.composite_key();

        let existed: bool = conn.exists(&skey).await.unwrap_or(false);

        match self.write_item(&mut conn, &skey, &item).await {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(err) => {
                warn!(key = %item.key, %err, "redis set failed");
                return Ok(false);
            }
        }

        // Index every tag after a successful write
        for tag in &item.tags {
            let tag_key = self.tag_key(tag);
            if let Err(err) = conn.sadd::<_, _, i64>(&tag_key, &composite).await {
                warn!(tag = %tag, %err, "tag index update failed");
            }
        }

        if existed {
            self.note_removed(item.region.as_deref(), None).await;
            self.publish(CacheEvent::ItemRemoved {
                key: item.key.clone(),
                region: item.region.clone(),
                reason: RemovalReason::Replaced,
            });
        }
        self.note_added(item.region.as_deref(), item.size_in_bytes).await;
        self.publish(CacheEvent::ItemAdded {
            key: item.key,
            region: item.region,
        });
        Ok(true)
    }

    // == Remove ==
    async fn remove(&self, key: &str, region: Option<&str>) -> Result<bool> {
        let mut conn = self.connection().await?;
        let skey = self.storage_key(key, region);

        // Fetch first so tag memberships can be reconciled
        let item = self.fetch_item(&mut conn, &skey).await.unwrap_or_default();

        let deleted: i64 = match conn.del(&skey).await {
            Ok(deleted) => deleted,
            Err(err) => {
                warn!(key, %err, "redis remove failed");
                return Ok(false);
            }
        };
        if deleted == 0 {
            return Ok(false);
        }

        if let Some(item) = item {
            self.reconcile_tags(&mut conn, &item.tags, &item.composite_key(), None)
                .await;
            self.note_removed(region, item.size_in_bytes).await;
            self.publish(CacheEvent::ItemRemoved {
                key: item.key,
                region: item.region,
                reason: RemovalReason::Removed,
            });
        } else {
            self.note_removed(region, None).await;
            self.publish(CacheEvent::ItemRemoved {
                key: key.to_string(),
                region: region.map(String::from),
                reason: RemovalReason::Removed,
            });
        }
        Ok(true)
    }

    // == Exists ==
    async fn exists(&self, key: &str, region: Option<&str>) -> Result<bool> {
        let mut conn = self.connection().await?;
        let skey = self.storage_key(key, region);
        match conn.exists(&skey).await {
            Ok(exists) => Ok(exists),
            Err(err) => {
                warn!(key, %err, "redis exists failed");
                Ok(false)
            }
        }
    }

    // == Clear ==
    async fn clear(&self, region: Option<&str>) -> Result<bool> {
        let mut conn = self.connection().await?;
        let pattern = match region {
            Some(region) => format!("{}{}:*", self.config.key_prefix, region),
            None => format!("{}*", self.config.key_prefix),
        };

        let keys = match self.scan_keys(&mut conn, &pattern).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(%err, "redis clear scan failed");
                return Ok(false);
            }
        };

        // No atomic bulk clear is assumed; delete one by one. Tag index
        // sets are wiped too but are not items, so they stay out of the
        // reported count
        let tag_prefix = format!("{}{}", self.config.key_prefix, TAG_SEGMENT);
        let mut count = 0usize;
        for key in keys {
            let is_tag_set = key.starts_with(&tag_prefix);
            match conn.del::<_, i64>(&key).await {
                Ok(deleted) if !is_tag_set => count += deleted as usize,
                Ok(_) => {}
                Err(err) => warn!(key = %key, %err, "redis clear delete failed"),
            }
        }

        {
            let mut stats = self.stats.lock().await;
            match region {
                Some(region) => stats.reset_region(region),
                None => stats.reset(),
            }
        }
        self.publish(CacheEvent::CacheCleared {
            region: region.map(String::from),
            count,
        });
        Ok(true)
    }

    // == Remove By Tag ==
    async fn remove_by_tag(&self, tag: &str) -> Result<usize> {
        let mut conn = self.connection().await?;
        let tag_key = self.tag_key(tag);

        let members: Vec<String> = match conn.smembers(&tag_key).await {
            Ok(members) => members,
            Err(err) => {
                warn!(tag, %err, "redis tag lookup failed");
                return Ok(0);
            }
        };

        let mut removed = 0usize;
        for member in members {
            let skey = format!("{}{}", self.config.key_prefix, member);
            // Learn the item's other tags before deleting so their index
            // sets do not accumulate stale members
            let item = self.fetch_item(&mut conn, &skey).await.unwrap_or_default();

            match conn.del::<_, i64>(&skey).await {
                Ok(deleted) if deleted > 0 => {
                    removed += 1;
                    let (key, region, size, tags) = match item {
                        Some(item) => (
                            item.key.clone(),
                            item.region.clone(),
                            item.size_in_bytes,
                            item.tags,
                        ),
                        None => (member.clone(), None, None, HashSet::new()),
                    };
                    self.reconcile_tags(&mut conn, &tags, &member, Some(tag)).await;
                    self.note_removed(region.as_deref(), size).await;
                    self.publish(CacheEvent::ItemRemoved {
                        key,
                        region,
                        reason: RemovalReason::TagInvalidation,
                    });
                }
                Ok(_) => {}
                Err(err) => warn!(tag, member = %member, %err, "tag member delete failed"),
            }
        }

        if let Err(err) = conn.del::<_, i64>(&tag_key).await {
            warn!(tag, %err, "tag index delete failed");
        }
        Ok(removed)
    }

    // == Get Keys By Tag ==
    async fn get_keys_by_tag(&self, tag: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let tag_key = self.tag_key(tag);
        match conn.smembers(&tag_key).await {
            Ok(members) => Ok(members),
            Err(err) => {
                warn!(tag, %err, "redis tag lookup failed");
                Ok(Vec::new())
            }
        }
    }

    // == Get Keys ==
    async fn get_keys(&self, region: Option<&str>) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let prefix = &self.config.key_prefix;
        let pattern = match region {
            Some(region) => format!("{prefix}{region}:*"),
            None => format!("{prefix}*"),
        };

        let keys = match self.scan_keys(&mut conn, &pattern).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(%err, "redis key scan failed");
                return Ok(Vec::new());
            }
        };

        let tag_prefix = format!("{prefix}{TAG_SEGMENT}");
        Ok(keys
            .into_iter()
            .filter(|key| !key.starts_with(&tag_prefix))
            .filter_map(|key| {
                let composite = key.strip_prefix(prefix.as_str())?;
                match region {
                    // Region-scoped listings return logical keys
                    Some(region) => composite
                        .strip_prefix(region)
                        .and_then(|rest| rest.strip_prefix(':'))
                        .map(String::from),
                    None => Some(composite.to_string()),
                }
            })
            .collect())
    }

    // == Get All ==
    async fn get_all(&self, region: &str) -> Result<Vec<CacheItem>> {
        let keys = self.get_keys(Some(region)).await?;
        let mut items = Vec::with_capacity(keys.len());
        for key in keys {
            // The normal read path handles expiry, telemetry and write-back
            if let Some(item) = self.get(&key, Some(region)).await? {
                items.push(item);
            }
        }
        Ok(items)
    }

    // == Refresh Expiration ==
    async fn refresh_expiration(
        &self,
        key: &str,
        region: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.connection().await?;
        let skey = self.storage_key(key, region);

        let item = match self.fetch_item(&mut conn, &skey).await {
            Ok(Some(item)) if !item.is_expired() => item,
            Ok(_) => return Ok(false),
            Err(err) => {
                warn!(key, %err, "redis refresh failed");
                return Ok(false);
            }
        };

        let mut item = item;
        item.expires_at = Some(expires_at);
        match self.write_item(&mut conn, &skey, &item).await {
            Ok(stored) => Ok(stored),
            Err(err) => {
                warn!(key, %err, "redis refresh write failed");
                Ok(false)
            }
        }
    }

    // == Perform Maintenance ==
    /// Backend TTLs handle expiration; maintenance only prunes tag index
    /// sets whose members no longer exist, deleting sets that end up empty.
    async fn perform_maintenance(&self) -> Result<usize> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}{}*", self.config.key_prefix, TAG_SEGMENT);

        let tag_keys = match self.scan_keys(&mut conn, &pattern).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(%err, "redis maintenance scan failed");
                return Ok(0);
            }
        };

        let mut pruned = 0usize;
        for tag_key in tag_keys {
            let members: Vec<String> = match conn.smembers(&tag_key).await {
                Ok(members) => members,
                Err(err) => {
                    warn!(tag_key = %tag_key, %err, "tag set read failed");
                    continue;
                }
            };

            for member in members {
                let skey = format!("{}{}", self.config.key_prefix, member);
                let alive: bool = conn.exists(&skey).await.unwrap_or(true);
                if !alive {
                    match conn.srem::<_, _, i64>(&tag_key, &member).await {
                        Ok(_) => pruned += 1,
                        Err(err) => warn!(member = %member, %err, "stale member prune failed"),
                    }
                }
            }

            let remaining: i64 = conn.scard(&tag_key).await.unwrap_or(1);
            if remaining == 0 {
                let _: i64 = conn.del(&tag_key).await.unwrap_or(0);
                debug!(tag_key = %tag_key, "empty tag index removed");
            }
        }

        self.publish(CacheEvent::MaintenancePerformed {
            count: pruned,
            kind: "tag-index-prune".to_string(),
        });
        Ok(pruned)
    }

    // == Statistics ==
    async fn statistics(&self) -> CacheStatistics {
        self.stats.lock().await.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }
}
