//! In-Memory Provider Module
//!
//! Concurrent key→item map held in process memory. Owns the capacity-aware
//! eviction algorithm and a statistics block fed by a bounded work queue,
//! so counters are eventually consistent with the operations that caused
//! them (the queue is drained by a single consumer task).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::config::{CacheConfig, MemoryConfig};
use crate::error::Result;
use crate::events::{CacheEvent, EvictionPolicy, RemovalReason};
use crate::item::{composite_key, key_in_region, CacheItem};
use crate::provider::CacheProvider;
use crate::stats::CacheStatistics;

/// Capacity of the statistics/event work queue.
const UPDATE_QUEUE_CAPACITY: usize = 1024;

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// == Statistics Deltas ==
/// One counter mutation, applied by the consumer task under the stats lock.
#[derive(Debug)]
enum Delta {
    Hit { region: Option<String> },
    Miss { region: Option<String> },
    Eviction { region: Option<String> },
    ItemAdded { region: Option<String>, size: Option<u64> },
    ItemRemoved { region: Option<String>, size: Option<u64> },
    ResetAll,
    ResetRegion(String),
}

/// Message on the work queue: a batch of deltas plus the events to publish,
/// or a flush marker used to observe the eventual-consistency window.
enum Update {
    Apply {
        deltas: Vec<Delta>,
        events: Vec<CacheEvent>,
    },
    Flush(oneshot::Sender<()>),
}

// == In-Memory Provider ==
/// Process-local cache provider backed by a concurrent map.
///
/// Independent keys proceed in parallel; the only serialization points are
/// the statistics consumer task and the eviction sweep, which walks all
/// live items.
pub struct InMemoryProvider {
    name: String,
    entries: Arc<DashMap<String, CacheItem>>,
    stats: Arc<Mutex<CacheStatistics>>,
    /// Authoritative running total used for eviction decisions; the stats
    /// block mirrors it eventually.
    tracked_size: Arc<AtomicU64>,
    updates: mpsc::Sender<Update>,
    events: broadcast::Sender<CacheEvent>,
    max_size_bytes: u64,
    compaction_percentage: f64,
    policy: EvictionPolicy,
    default_ttl: u64,
    track_sizes: bool,
}

impl InMemoryProvider {
    // == Constructors ==
    /// Creates a provider named "memory" from the cache configuration.
    ///
    /// Must be called within a Tokio runtime: the statistics consumer task
    /// is spawned here.
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_name(
            "memory",
            config.memory.clone(),
            config.default_ttl,
            config.track_sizes,
        )
    }

    /// Creates a provider with an explicit name and settings.
    pub fn with_name(
        name: &str,
        memory: MemoryConfig,
        default_ttl: u64,
        track_sizes: bool,
    ) -> Self {
        let stats = Arc::new(Mutex::new(CacheStatistics::new()));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (updates, rx) = mpsc::channel(UPDATE_QUEUE_CAPACITY);

        spawn_stats_worker(Arc::clone(&stats), events.clone(), rx);

        // Policy name falls back to LRU; FromStr is infallible
        let policy = memory.eviction_policy.parse().unwrap_or_default();

        Self {
            name: name.to_string(),
            entries: Arc::new(DashMap::new()),
            stats,
            tracked_size: Arc::new(AtomicU64::new(0)),
            updates,
            events,
            max_size_bytes: memory.max_size_bytes,
            compaction_percentage: memory.compaction_percentage,
            policy,
            default_ttl,
            track_sizes,
        }
    }

    // == Flush ==
    /// Waits until every statistics/event update queued before this call
    /// has been applied. Statistics are eventually consistent; this bounds
    /// the window for callers that need to observe them.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.updates.send(Update::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Current tracked size in bytes.
    pub fn tracked_size(&self) -> u64 {
        self.tracked_size.load(Ordering::Acquire)
    }

    /// Number of entries currently stored, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    async fn send_update(&self, deltas: Vec<Delta>, events: Vec<CacheEvent>) {
        // Bounded queue: backpressure instead of unbounded fire-and-forget
        let _ = self.updates.send(Update::Apply { deltas, events }).await;
    }

    fn subtract_tracked(&self, size: u64) {
        let _ = self
            .tracked_size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(size))
            });
    }

    /// Removes one entry through the normal accounting path.
    async fn remove_inner(&self, key: &str, region: Option<&str>, reason: RemovalReason) -> bool {
        let ck = composite_key(key, region);
        match self.entries.remove(&ck) {
            Some((_, item)) => {
                let size = item.size_in_bytes;
                self.subtract_tracked(size.unwrap_or(0));
                self.send_update(
                    vec![Delta::ItemRemoved {
                        region: item.region.clone(),
                        size,
                    }],
                    vec![CacheEvent::ItemRemoved {
                        key: item.key,
                        region: item.region,
                        reason,
                    }],
                )
                .await;
                true
            }
            None => false,
        }
    }

    // == Eviction ==
    /// Evicts live items in policy order until the tracked size is at or
    /// below `limit × (1 − compaction)`. No-ops when the limit or the
    /// computed target is invalid.
    async fn evict_to_target(&self) -> usize {
        if !self.track_sizes || self.max_size_bytes == 0 {
            return 0;
        }
        if !self.compaction_percentage.is_finite()
            || !(0.0..=1.0).contains(&self.compaction_percentage)
        {
            return 0;
        }
        let target =
            (self.max_size_bytes as f64 * (1.0 - self.compaction_percentage)) as u64;
        if target == 0 {
            return 0;
        }

        let mut running = self.tracked_size.load(Ordering::Acquire);
        if running <= target {
            return 0;
        }

        // Candidate set: all live items, ordered per policy
        let mut candidates: Vec<Candidate> = self
            .entries
            .iter()
            .filter(|entry| !entry.value().is_expired())
            .map(|entry| Candidate {
                composite: entry.key().clone(),
                last_accessed_at: entry.value().last_accessed_at,
                access_count: entry.value().access_count,
                created_at: entry.value().created_at,
            })
            .collect();

        match self.policy {
            EvictionPolicy::Lru => candidates.sort_by_key(|c| c.last_accessed_at),
            EvictionPolicy::Lfu => candidates.sort_by_key(|c| c.access_count),
            EvictionPolicy::Fifo => candidates.sort_by_key(|c| c.created_at),
        }

        let mut evicted = 0;
        for candidate in candidates {
            if running <= target {
                break;
            }
            if let Some((_, item)) = self.entries.remove(&candidate.composite) {
                let size = item.size_in_bytes;
                running = running.saturating_sub(size.unwrap_or(0));
                self.subtract_tracked(size.unwrap_or(0));
                evicted += 1;
                self.send_update(
                    vec![
                        Delta::Eviction {
                            region: item.region.clone(),
                        },
                        Delta::ItemRemoved {
                            region: item.region.clone(),
                            size,
                        },
                    ],
                    vec![CacheEvent::ItemRemoved {
                        key: item.key,
                        region: item.region,
                        reason: RemovalReason::Evicted,
                    }],
                )
                .await;
            }
        }

        if evicted > 0 {
            debug!(evicted, target, "eviction pass completed");
        }
        evicted
    }
}

/// Eviction ordering inputs snapshotted from a live item.
struct Candidate {
    composite: String,
    last_accessed_at: DateTime<Utc>,
    access_count: u64,
    created_at: DateTime<Utc>,
}

/// Outcome of the locked portion of a lookup, resolved before any await.
enum Lookup {
    Absent,
    Expired(CacheItem),
    Hit(CacheItem),
}

#[async_trait::async_trait]
impl CacheProvider for InMemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    // == Get ==
    async fn get(&self, key: &str, region: Option<&str>) -> Result<Option<CacheItem>> {
        let ck = composite_key(key, region);

        // Resolve under the shard lock, then account for it after
        let lookup = match self.entries.entry(ck) {
            Entry::Vacant(_) => Lookup::Absent,
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    Lookup::Expired(occupied.remove())
                } else {
                    let item = occupied.get_mut();
                    item.mark_accessed();
                    Lookup::Hit(item.clone())
                }
            }
        };

        match lookup {
            Lookup::Absent => {
                self.send_update(
                    vec![Delta::Miss {
                        region: region.map(String::from),
                    }],
                    vec![CacheEvent::ItemAccessed {
                        key: key.to_string(),
                        region: region.map(String::from),
                        hit: false,
                    }],
                )
                .await;
                Ok(None)
            }
            Lookup::Expired(item) => {
                let size = item.size_in_bytes;
                self.subtract_tracked(size.unwrap_or(0));
                self.send_update(
                    vec![
                        Delta::ItemRemoved {
                            region: item.region.clone(),
                            size,
                        },
                        Delta::Miss {
                            region: region.map(String::from),
                        },
                    ],
                    vec![
                        CacheEvent::ItemRemoved {
                            key: item.key,
                            region: item.region,
                            reason: RemovalReason::Expired,
                        },
                        CacheEvent::ItemAccessed {
                            key: key.to_string(),
                            region: region.map(String::from),
                            hit: false,
                        },
                    ],
                )
                .await;
                Ok(None)
            }
            Lookup::Hit(item) => {
                self.send_update(
                    vec![Delta::Hit {
                        region: region.map(String::from),
                    }],
                    vec![CacheEvent::ItemAccessed {
                        key: key.to_string(),
                        region: region.map(String::from),
                        hit: true,
                    }],
                )
                .await;
                Ok(Some(item))
            }
        }
    }

    // == Set ==
    async fn set(&self, mut item: CacheItem) -> Result<bool> {
        // Normalize to a concrete expiration so is_expired stays meaningful
        if item.expires_at.is_none() {
            item.expires_at = Some(Utc::now() + Duration::seconds(self.default_ttl as i64));
        }

        if self.track_sizes {
            item.size_in_bytes = item.estimate_size();
            if item.size_in_bytes.is_none() {
                warn!(key = %item.key, "size estimation failed, item stored untracked");
            }
        }
        let incoming = item.size_in_bytes.unwrap_or(0);

        // Eviction runs before insertion, against the pre-insert size, so a
        // single oversized item can still land (best-effort, not a hard cap)
        if self.track_sizes
            && self.max_size_bytes > 0
            && self.tracked_size.load(Ordering::Acquire) + incoming > self.max_size_bytes
        {
            self.evict_to_target().await;
        }

        let ck = item.composite_key();
        let region = item.region.clone();
        let key = item.key.clone();
        let tracked = item.size_in_bytes;
        let previous = self.entries.insert(ck, item);

        self.tracked_size.fetch_add(incoming, Ordering::AcqRel);

        let mut deltas = Vec::with_capacity(2);
        let mut events = Vec::with_capacity(2);
        if let Some(previous) = previous {
            let size = previous.size_in_bytes;
            self.subtract_tracked(size.unwrap_or(0));
            deltas.push(Delta::ItemRemoved {
                region: previous.region.clone(),
                size,
            });
            events.push(CacheEvent::ItemRemoved {
                key: previous.key,
                region: previous.region,
                reason: RemovalReason::Replaced,
            });
        }
        deltas.push(Delta::ItemAdded {
            region: region.clone(),
            size: tracked,
        });
        events.push(CacheEvent::ItemAdded { key, region });

        self.send_update(deltas, events).await;
        Ok(true)
    }

    // == Remove ==
    async fn remove(&self, key: &str, region: Option<&str>) -> Result<bool> {
        Ok(self.remove_inner(key, region, RemovalReason::Removed).await)
    }

    // == Exists ==
    async fn exists(&self, key: &str, region: Option<&str>) -> Result<bool> {
        let ck = composite_key(key, region);
        let expired = match self.entries.get(&ck) {
            Some(entry) => {
                if entry.is_expired() {
                    true
                } else {
                    return Ok(true);
                }
            }
            None => return Ok(false),
        };

        if expired {
            // Asynchronous removal; the caller only learns "not present".
            // Conditional on the entry still being expired: the caller may
            // have already written a fresh value for this key
            let entries = Arc::clone(&self.entries);
            let tracked = Arc::clone(&self.tracked_size);
            let updates = self.updates.clone();
            tokio::spawn(async move {
                if let Some((_, item)) = entries.remove_if(&ck, |_, item| item.is_expired()) {
                    let size = item.size_in_bytes;
                    let _ = tracked.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                        Some(v.saturating_sub(size.unwrap_or(0)))
                    });
                    let _ = updates
                        .send(Update::Apply {
                            deltas: vec![Delta::ItemRemoved {
                                region: item.region.clone(),
                                size,
                            }],
                            events: vec![CacheEvent::ItemRemoved {
                                key: item.key,
                                region: item.region,
                                reason: RemovalReason::Expired,
                            }],
                        })
                        .await;
                }
            });
        }
        Ok(false)
    }

    // == Clear ==
    async fn clear(&self, region: Option<&str>) -> Result<bool> {
        match region {
            None => {
                let count = self.entries.len();
                self.entries.clear();
                self.tracked_size.store(0, Ordering::Release);
                self.send_update(
                    vec![Delta::ResetAll],
                    vec![CacheEvent::CacheCleared {
                        region: None,
                        count,
                    }],
                )
                .await;
                Ok(true)
            }
            Some(region) => {
                let keys: Vec<String> = self
                    .entries
                    .iter()
                    .filter(|entry| key_in_region(entry.key(), region))
                    .map(|entry| entry.key().clone())
                    .collect();

                let mut count = 0;
                for ck in keys {
                    if let Some((_, item)) = self.entries.remove(&ck) {
                        self.subtract_tracked(item.size_in_bytes.unwrap_or(0));
                        count += 1;
                    }
                }

                self.send_update(
                    vec![Delta::ResetRegion(region.to_string())],
                    vec![CacheEvent::CacheCleared {
                        region: Some(region.to_string()),
                        count,
                    }],
                )
                .await;
                Ok(true)
            }
        }
    }

    // == Remove By Tag ==
    async fn remove_by_tag(&self, tag: &str) -> Result<usize> {
        // Linear scan, then removal through the normal path so statistics
        // and events stay consistent
        let matches: Vec<(String, Option<String>)> = self
            .entries
            .iter()
            .filter(|entry| entry.value().tags.contains(tag))
            .map(|entry| (entry.value().key.clone(), entry.value().region.clone()))
            .collect();

        let mut removed = 0;
        for (key, region) in matches {
            if self
                .remove_inner(&key, region.as_deref(), RemovalReason::TagInvalidation)
                .await
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    // == Get Keys By Tag ==
    async fn get_keys_by_tag(&self, tag: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| !entry.value().is_expired() && entry.value().tags.contains(tag))
            .map(|entry| entry.key().clone())
            .collect())
    }

    // == Get Keys ==
    async fn get_keys(&self, region: Option<&str>) -> Result<Vec<String>> {
        match region {
            None => Ok(self.entries.iter().map(|e| e.key().clone()).collect()),
            Some(region) => Ok(self
                .entries
                .iter()
                .filter(|entry| key_in_region(entry.key(), region))
                .map(|entry| entry.value().key.clone())
                .collect()),
        }
    }

    // == Get All ==
    async fn get_all(&self, region: &str) -> Result<Vec<CacheItem>> {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| key_in_region(entry.key(), region))
            .map(|entry| entry.key().clone())
            .collect();

        let mut items = Vec::new();
        for ck in keys {
            let hit = match self.entries.entry(ck) {
                Entry::Vacant(_) => None,
                Entry::Occupied(mut occupied) => {
                    if occupied.get().is_expired() {
                        None
                    } else {
                        let item = occupied.get_mut();
                        item.mark_accessed();
                        Some(item.clone())
                    }
                }
            };
            if let Some(item) = hit {
                self.send_update(
                    vec![Delta::Hit {
                        region: Some(region.to_string()),
                    }],
                    vec![CacheEvent::ItemAccessed {
                        key: item.key.clone(),
                        region: item.region.clone(),
                        hit: true,
                    }],
                )
                .await;
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
        let ck = composite_key(key, region);
        match self.entries.get_mut(&ck) {
            Some(mut entry) => {
                if entry.is_expired() {
                    Ok(false)
                } else {
                    entry.expires_at = Some(expires_at);
                    Ok(true)
                }
            }
            None => Ok(false),
        }
    }

    // == Perform Maintenance ==
    async fn perform_maintenance(&self) -> Result<usize> {
        // Sweep expired entries first
        let expired: Vec<(String, Option<String>)> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_expired())
            .map(|entry| (entry.value().key.clone(), entry.value().region.clone()))
            .collect();

        let mut removed = 0;
        for (key, region) in expired {
            if self
                .remove_inner(&key, region.as_deref(), RemovalReason::Expired)
                .await
            {
                removed += 1;
            }
        }

        // Then compact if the sweep was not enough
        if self.track_sizes
            && self.max_size_bytes > 0
            && self.tracked_size.load(Ordering::Acquire) > self.max_size_bytes
        {
            removed += self.evict_to_target().await;
        }

        self.send_update(
            Vec::new(),
            vec![CacheEvent::MaintenancePerformed {
                count: removed,
                kind: "memory-sweep".to_string(),
            }],
        )
        .await;
        Ok(removed)
    }

    // == Statistics ==
    async fn statistics(&self) -> CacheStatistics {
        self.stats.lock().await.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }
}

// == Statistics Worker ==
/// Single consumer draining the bounded work queue: applies counter deltas
/// under the stats lock and publishes the corresponding events. Exits when
/// every sender is dropped.
fn spawn_stats_worker(
    stats: Arc<Mutex<CacheStatistics>>,
    events: broadcast::Sender<CacheEvent>,
    mut rx: mpsc::Receiver<Update>,
) {
    tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            match update {
                Update::Apply {
                    deltas,
                    events: to_publish,
                } => {
                    {
                        let mut stats = stats.lock().await;
                        for delta in deltas {
                            match delta {
                                Delta::Hit { region } => stats.record_hit(region.as_deref()),
                                Delta::Miss { region } => stats.record_miss(region.as_deref()),
                                Delta::Eviction { region } => {
                                    stats.record_eviction(region.as_deref())
                                }
                                Delta::ItemAdded { region, size } => {
                                    stats.record_item_added(region.as_deref(), size)
                                }
                                Delta::ItemRemoved { region, size } => {
                                    stats.record_item_removed(region.as_deref(), size)
                                }
                                Delta::ResetAll => stats.reset(),
                                Delta::ResetRegion(region) => stats.reset_region(&region),
                            }
                        }
                    }
                    for event in to_publish {
                        // No subscribers is fine; events are one-way
                        let _ = events.send(event);
                    }
                }
                Update::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
    });
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn provider() -> InMemoryProvider {
        InMemoryProvider::with_name("memory", MemoryConfig::default(), 300, true)
    }

    fn sized_provider(limit: u64, compaction: f64, policy: &str) -> InMemoryProvider {
        InMemoryProvider::with_name(
            "memory",
            MemoryConfig {
                max_size_bytes: limit,
                compaction_percentage: compaction,
                eviction_policy: policy.to_string(),
            },
            300,
            true,
        )
    }

    fn item(key: &str, region: Option<&str>, value: &str) -> CacheItem {
        CacheItem::new(
            key,
            region.map(String::from),
            serde_json::json!(value),
            "alloc::string::String",
            HashSet::new(),
            None,
        )
    }

    fn tagged_item(key: &str, value: &str, tags: &[&str]) -> CacheItem {
        CacheItem::new(
            key,
            None,
            serde_json::json!(value),
            "alloc::string::String",
            tags.iter().map(|t| t.to_string()).collect(),
            None,
        )
    }

    /// Item with a fixed-length payload; all metadata fields have the same
    /// shape, so items built this way serialize to near-identical sizes.
    fn payload_item(key: &str) -> CacheItem {
        item(key, None, &"x".repeat(100))
    }

    /// Serialized size of a `payload_item` once its expiration is normalized.
    fn payload_item_size() -> u64 {
        let mut probe = payload_item("a");
        probe.expires_at = Some(Utc::now() + Duration::seconds(300));
        probe.estimate_size().unwrap()
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let cache = provider();
        cache.set(item("k1", None, "v1")).await.unwrap();

        let hit = cache.get("k1", None).await.unwrap().unwrap();
        assert_eq!(hit.value, serde_json::json!("v1"));
        assert_eq!(hit.access_count, 1);
        assert!(hit.expires_at.is_some(), "default TTL must be normalized");
    }

    #[tokio::test]
    async fn test_get_missing_records_miss() {
        let cache = provider();
        assert!(cache.get("nope", None).await.unwrap().is_none());

        cache.flush().await;
        let stats = cache.statistics().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[tokio::test]
    async fn test_expired_get_removes_and_misses() {
        let cache = provider();
        let mut expired = item("k1", None, "v1");
        expired.expires_at = Some(Utc::now() - Duration::seconds(1));
        cache.set(expired).await.unwrap();

        assert!(cache.get("k1", None).await.unwrap().is_none());
        assert!(cache.is_empty());

        cache.flush().await;
        let stats = cache.statistics().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.item_count, 0);
    }

    #[tokio::test]
    async fn test_replace_publishes_removed_then_added() {
        let cache = provider();
        let mut events = cache.subscribe();

        cache.set(item("k1", None, "v1")).await.unwrap();
        cache.set(item("k1", None, "v2")).await.unwrap();
        cache.flush().await;

        let mut reasons = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let CacheEvent::ItemRemoved { reason, .. } = event {
                reasons.push(reason);
            }
        }
        assert_eq!(reasons, vec![RemovalReason::Replaced]);
        assert_eq!(cache.len(), 1);

        let stats = cache.statistics().await;
        assert_eq!(stats.item_count, 1);
    }

    #[tokio::test]
    async fn test_remove() {
        let cache = provider();
        cache.set(item("k1", None, "v1")).await.unwrap();

        assert!(cache.remove("k1", None).await.unwrap());
        assert!(!cache.remove("k1", None).await.unwrap());
        assert!(cache.get("k1", None).await.unwrap().is_none());

        cache.flush().await;
        assert_eq!(cache.statistics().await.item_count, 0);
        assert_eq!(cache.tracked_size(), 0);
    }

    #[tokio::test]
    async fn test_exists() {
        let cache = provider();
        cache.set(item("k1", None, "v1")).await.unwrap();

        assert!(cache.exists("k1", None).await.unwrap());
        assert!(!cache.exists("missing", None).await.unwrap());

        let mut expired = item("k2", None, "v2");
        expired.expires_at = Some(Utc::now() - Duration::seconds(1));
        cache.set(expired).await.unwrap();
        assert!(!cache.exists("k2", None).await.unwrap());

        // The expired entry is removed in the background
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_exists_removal_spares_fresh_write() {
        let cache = provider();
        let mut expired = item("k1", None, "old");
        expired.expires_at = Some(Utc::now() - Duration::seconds(1));
        cache.set(expired).await.unwrap();

        // The miss-then-populate flow: exists reports absent, the caller
        // immediately writes a fresh value for the same key
        assert!(!cache.exists("k1", None).await.unwrap());
        cache.set(item("k1", None, "new")).await.unwrap();

        // The deferred removal must not take the fresh live item with it
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let hit = cache.get("k1", None).await.unwrap().unwrap();
        assert_eq!(hit.value, serde_json::json!("new"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_clear_all_resets_statistics() {
        let cache = provider();
        cache.set(item("k1", None, "v1")).await.unwrap();
        cache.set(item("k2", Some("r"), "v2")).await.unwrap();
        cache.get("k1", None).await.unwrap();

        cache.clear(None).await.unwrap();
        cache.flush().await;

        assert!(cache.is_empty());
        assert_eq!(cache.tracked_size(), 0);
        let stats = cache.statistics().await;
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.item_count, 0);
    }

    #[tokio::test]
    async fn test_clear_region_isolation() {
        let cache = provider();
        cache.set(item("k1", Some("a"), "v1")).await.unwrap();
        cache.set(item("k2", Some("b"), "v2")).await.unwrap();
        cache.get("k2", Some("b")).await.unwrap();

        cache.clear(Some("a")).await.unwrap();
        cache.flush().await;

        assert!(cache.get("k1", Some("a")).await.unwrap().is_none());
        assert!(cache.get("k2", Some("b")).await.unwrap().is_some());

        cache.flush().await;
        let stats = cache.statistics().await;
        assert_eq!(stats.regions["a"].item_count, 0);
        assert_eq!(stats.regions["b"].item_count, 1);
        assert!(stats.regions["b"].hits >= 1);
    }

    #[tokio::test]
    async fn test_remove_by_tag() {
        let cache = provider();
        cache.set(tagged_item("k1", "v1", &["t1"])).await.unwrap();
        cache.set(tagged_item("k2", "v2", &["t1", "t2"])).await.unwrap();
        cache.set(tagged_item("k3", "v3", &["t2"])).await.unwrap();

        let removed = cache.remove_by_tag("t1").await.unwrap();
        assert_eq!(removed, 2);
        assert!(!cache.exists("k1", None).await.unwrap());
        assert!(!cache.exists("k2", None).await.unwrap());
        assert!(cache.exists("k3", None).await.unwrap());
        assert!(cache.get_keys_by_tag("t1").await.unwrap().is_empty());
        assert_eq!(cache.get_keys_by_tag("t2").await.unwrap(), vec!["k3"]);
    }

    #[tokio::test]
    async fn test_get_keys_and_get_all() {
        let cache = provider();
        cache.set(item("k1", Some("r"), "v1")).await.unwrap();
        cache.set(item("k2", Some("r"), "v2")).await.unwrap();
        cache.set(item("k3", None, "v3")).await.unwrap();

        let mut region_keys = cache.get_keys(Some("r")).await.unwrap();
        region_keys.sort();
        assert_eq!(region_keys, vec!["k1", "k2"]);
        assert_eq!(cache.get_keys(None).await.unwrap().len(), 3);

        let all = cache.get_all("r").await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|item| item.access_count == 1));
    }

    #[tokio::test]
    async fn test_get_all_skips_expired() {
        let cache = provider();
        cache.set(item("k1", Some("r"), "v1")).await.unwrap();
        let mut expired = item("k2", Some("r"), "v2");
        expired.expires_at = Some(Utc::now() - Duration::seconds(1));
        cache.set(expired).await.unwrap();

        let all = cache.get_all("r").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key, "k1");
    }

    #[tokio::test]
    async fn test_refresh_expiration() {
        let cache = provider();
        cache.set(item("k1", None, "v1")).await.unwrap();

        let new_expiry = Utc::now() + Duration::seconds(3600);
        assert!(cache.refresh_expiration("k1", None, new_expiry).await.unwrap());
        assert!(!cache.refresh_expiration("missing", None, new_expiry).await.unwrap());

        let refreshed = cache.get("k1", None).await.unwrap().unwrap();
        assert_eq!(refreshed.expires_at, Some(new_expiry));

        // Expired items are not refreshable
        let mut expired = item("k2", None, "v2");
        expired.expires_at = Some(Utc::now() - Duration::seconds(1));
        cache.set(expired).await.unwrap();
        assert!(!cache.refresh_expiration("k2", None, new_expiry).await.unwrap());
    }

    #[tokio::test]
    async fn test_maintenance_removes_expired() {
        let cache = provider();
        cache.set(item("keep", None, "v")).await.unwrap();
        let mut expired = item("drop", None, "v");
        expired.expires_at = Some(Utc::now() - Duration::seconds(1));
        cache.set(expired).await.unwrap();

        let removed = cache.perform_maintenance().await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.exists("keep", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_eviction_lru_scenario() {
        // Limit 2.5 item-sizes, compaction 0.5 -> target 1.25 item-sizes.
        // Insert a, b, touch a, insert c: b is least recently used, so
        // inserting c evicts b and stops at the target.
        let size = payload_item_size();
        let cache = sized_provider(size * 5 / 2, 0.5, "lru");

        cache.set(payload_item("a")).await.unwrap();
        cache.set(payload_item("b")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        cache.get("a", None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        cache.set(payload_item("c")).await.unwrap();
        cache.flush().await;

        assert!(cache.get("b", None).await.unwrap().is_none(), "b was LRU");
        assert!(cache.get("a", None).await.unwrap().is_some());
        assert!(cache.get("c", None).await.unwrap().is_some());

        cache.flush().await;
        assert!(cache.statistics().await.evictions >= 1);
    }

    #[tokio::test]
    async fn test_eviction_respects_target() {
        let size = payload_item_size();
        let limit = size * 5 / 2;
        let cache = sized_provider(limit, 0.5, "lru");
        for i in 0..6 {
            cache.set(payload_item(&format!("k{}", i))).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        cache.flush().await;

        // Each insert that crossed the limit compacted down to the target
        // first, so the running total never settles above the limit
        assert!(cache.tracked_size() <= limit + size / 10);
    }

    #[tokio::test]
    async fn test_eviction_fifo_policy() {
        let size = payload_item_size();
        let cache = sized_provider(size * 5 / 2, 0.5, "fifo");

        cache.set(payload_item("first")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        cache.set(payload_item("second")).await.unwrap();
        // Touching "first" must not save it under FIFO
        cache.get("first", None).await.unwrap();
        cache.set(payload_item("third")).await.unwrap();
        cache.flush().await;

        assert!(cache.get("first", None).await.unwrap().is_none());
        assert!(cache.get("second", None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_eviction_lfu_policy() {
        let size = payload_item_size();
        let cache = sized_provider(size * 5 / 2, 0.5, "lfu");

        cache.set(payload_item("hot")).await.unwrap();
        cache.set(payload_item("cold")).await.unwrap();
        cache.get("hot", None).await.unwrap();
        cache.get("hot", None).await.unwrap();
        cache.set(payload_item("new")).await.unwrap();
        cache.flush().await;

        assert!(cache.get("cold", None).await.unwrap().is_none());
        assert!(cache.get("hot", None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_eviction_noop_when_untracked() {
        let cache = InMemoryProvider::with_name(
            "memory",
            MemoryConfig {
                max_size_bytes: 10,
                compaction_percentage: 0.5,
                eviction_policy: "lru".to_string(),
            },
            300,
            false, // size tracking off
        );

        cache.set(item("a", None, "a value far over ten bytes")).await.unwrap();
        cache.set(item("b", None, "another value far over ten bytes")).await.unwrap();
        assert_eq!(cache.len(), 2, "no eviction without size tracking");
    }

    #[tokio::test]
    async fn test_eviction_skips_expired_candidates() {
        let size = payload_item_size();
        let cache = sized_provider(size * 5 / 2, 0.5, "lru");
        let mut expired = payload_item("dead");
        expired.expires_at = Some(Utc::now() - Duration::seconds(1));
        cache.set(expired).await.unwrap();
        cache.set(payload_item("live")).await.unwrap();

        // Next set triggers eviction; the expired entry is not a candidate
        // so the oldest live entry goes instead
        cache.set(payload_item("new")).await.unwrap();
        cache.flush().await;
        assert!(cache.get("new", None).await.unwrap().is_some());
        assert!(cache.get("live", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_statistics_eventually_consistent() {
        let cache = provider();
        cache.set(item("k1", None, "v1")).await.unwrap();
        cache.get("k1", None).await.unwrap();
        let _ = cache.get("missing", None).await.unwrap();

        cache.flush().await;
        let stats = cache.statistics().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.item_count, 1);
        assert!(stats.total_size_in_bytes.unwrap() > 0);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[tokio::test]
    async fn test_concurrent_writers_distinct_keys() {
        let cache = Arc::new(provider());
        let mut handles = Vec::new();
        for i in 0..32 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.set(item(&format!("k{}", i), None, "v")).await.unwrap();
                cache.get(&format!("k{}", i), None).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        cache.flush().await;
        let stats = cache.statistics().await;
        assert_eq!(stats.item_count, 32);
        assert_eq!(stats.hits, 32);
        assert_eq!(cache.len(), 32);
    }
}
