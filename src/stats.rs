//! Cache Statistics Module
//!
//! Tracks cache performance metrics including hits, misses and evictions,
//! globally and per region.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

// == Region Stats ==
/// Counters scoped to a single region.
#[derive(Debug, Clone, Serialize)]
pub struct RegionStatistics {
    /// Number of successful retrievals
    pub hits: u64,
    /// Number of failed retrievals (key not found or expired)
    pub misses: u64,
    /// Number of items evicted by the capacity policy
    pub evictions: u64,
    /// Current number of items in the region
    pub item_count: u64,
    /// Tracked bytes in the region, None when size tracking is off
    pub total_size_in_bytes: Option<u64>,
    /// When these counters were last reset
    pub last_reset: DateTime<Utc>,
}

impl Default for RegionStatistics {
    fn default() -> Self {
        Self {
            hits: 0,
            misses: 0,
            evictions: 0,
            item_count: 0,
            total_size_in_bytes: None,
            last_reset: Utc::now(),
        }
    }
}

impl RegionStatistics {
    /// Calculates the hit rate: hits / (hits + misses), or 0.0 with no requests.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// == Cache Stats ==
/// Global cache performance metrics plus a per-region breakdown.
///
/// Decrements are clamped at zero: item counts and byte totals never go
/// negative even when removal accounting races with concurrent writes.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatistics {
    /// Number of successful retrievals
    pub hits: u64,
    /// Number of failed retrievals (key not found or expired)
    pub misses: u64,
    /// Number of items evicted by the capacity policy
    pub evictions: u64,
    /// Current number of items in the cache
    pub item_count: u64,
    /// Tracked bytes, None when size tracking is off
    pub total_size_in_bytes: Option<u64>,
    /// When the global counters were last reset
    pub last_reset: DateTime<Utc>,
    /// Per-region counters, keyed by region name
    pub regions: HashMap<String, RegionStatistics>,
}

impl Default for CacheStatistics {
    fn default() -> Self {
        Self {
            hits: 0,
            misses: 0,
            evictions: 0,
            item_count: 0,
            total_size_in_bytes: None,
            last_reset: Utc::now(),
            regions: HashMap::new(),
        }
    }
}

impl CacheStatistics {
    /// Creates a new CacheStatistics with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    // == Hit Rate ==
    /// Calculates the global hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no requests have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    fn region_mut(&mut self, region: &str) -> &mut RegionStatistics {
        self.regions.entry(region.to_string()).or_default()
    }

    // == Record Hit ==
    /// Increments the hit counter, globally and for the region if given.
    pub fn record_hit(&mut self, region: Option<&str>) {
        self.hits += 1;
        if let Some(region) = region {
            self.region_mut(region).hits += 1;
        }
    }

    // == Record Miss ==
    /// Increments the miss counter, globally and for the region if given.
    pub fn record_miss(&mut self, region: Option<&str>) {
        self.misses += 1;
        if let Some(region) = region {
            self.region_mut(region).misses += 1;
        }
    }

    // == Record Eviction ==
    /// Increments the eviction counter, globally and for the region if given.
    pub fn record_eviction(&mut self, region: Option<&str>) {
        self.evictions += 1;
        if let Some(region) = region {
            self.region_mut(region).evictions += 1;
        }
    }

    // == Record Item Added ==
    /// Accounts for a newly stored item and its tracked size.
    pub fn record_item_added(&mut self, region: Option<&str>, size: Option<u64>) {
        self.item_count += 1;
        if let Some(size) = size {
            *self.total_size_in_bytes.get_or_insert(0) += size;
        }
        if let Some(region) = region {
            let stats = self.region_mut(region);
            stats.item_count += 1;
            if let Some(size) = size {
                *stats.total_size_in_bytes.get_or_insert(0) += size;
            }
        }
    }

    // == Record Item Removed ==
    /// Accounts for a removed item; decrements are clamped at zero.
    pub fn record_item_removed(&mut self, region: Option<&str>, size: Option<u64>) {
        self.item_count = self.item_count.saturating_sub(1);
        if let (Some(total), Some(size)) = (self.total_size_in_bytes.as_mut(), size) {
            *total = total.saturating_sub(size);
        }
        if let Some(region) = region {
            let stats = self.region_mut(region);
            stats.item_count = stats.item_count.saturating_sub(1);
            if let (Some(total), Some(size)) = (stats.total_size_in_bytes.as_mut(), size) {
                *total = total.saturating_sub(size);
            }
        }
    }

    // == Reset ==
    /// Resets all counters, global and per-region, with a fresh reset time.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Resets the counters of one region; global counters are adjusted by
    /// the region's item count and tracked size so the totals stay coherent.
    pub fn reset_region(&mut self, region: &str) {
        if let Some(stats) = self.regions.get(region) {
            let removed_items = stats.item_count;
            let removed_bytes = stats.total_size_in_bytes;
            self.item_count = self.item_count.saturating_sub(removed_items);
            if let (Some(total), Some(bytes)) = (self.total_size_in_bytes.as_mut(), removed_bytes) {
                *total = total.saturating_sub(bytes);
            }
        }
        self.regions.insert(region.to_string(), RegionStatistics::default());
    }
}
