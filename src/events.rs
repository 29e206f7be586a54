//! Cache Events Module
//!
//! Lifecycle notifications published by providers and the eviction policy
//! selector. Events are a one-way channel: the cache never reads them back.

use std::str::FromStr;

use serde::Serialize;

// == Removal Reason ==
/// Why an item left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RemovalReason {
    /// TTL elapsed
    Expired,
    /// Overwritten by a new value for the same key
    Replaced,
    /// Explicitly removed by a caller
    Removed,
    /// Evicted by the capacity policy
    Evicted,
    /// Removed as part of a tag invalidation
    TagInvalidation,
}

// == Cache Event ==
/// Lifecycle notification published by a provider.
#[derive(Debug, Clone, Serialize)]
pub enum CacheEvent {
    /// An item was stored
    ItemAdded {
        key: String,
        region: Option<String>,
    },
    /// An item left the cache
    ItemRemoved {
        key: String,
        region: Option<String>,
        reason: RemovalReason,
    },
    /// An item was looked up
    ItemAccessed {
        key: String,
        region: Option<String>,
        hit: bool,
    },
    /// A clear operation completed
    CacheCleared {
        region: Option<String>,
        count: usize,
    },
    /// A maintenance pass completed
    MaintenancePerformed {
        count: usize,
        kind: String,
    },
}

// == Eviction Policy ==
/// Ordering rule used to pick eviction victims when capacity is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Least recently used: ascending last-access time
    #[default]
    Lru,
    /// Least frequently used: ascending access count
    Lfu,
    /// First in, first out: ascending creation time
    Fifo,
}

impl FromStr for EvictionPolicy {
    type Err = std::convert::Infallible;

    /// Parses a policy name; unrecognized names fall back to LRU.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "lfu" => EvictionPolicy::Lfu,
            "fifo" => EvictionPolicy::Fifo,
            _ => EvictionPolicy::Lru,
        })
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parsing() {
        assert_eq!("lru".parse::<EvictionPolicy>().unwrap(), EvictionPolicy::Lru);
        assert_eq!("LFU".parse::<EvictionPolicy>().unwrap(), EvictionPolicy::Lfu);
        assert_eq!("fifo".parse::<EvictionPolicy>().unwrap(), EvictionPolicy::Fifo);
    }

    #[test]
    fn test_unknown_policy_falls_back_to_lru() {
        assert_eq!(
            "most-recently-used".parse::<EvictionPolicy>().unwrap(),
            EvictionPolicy::Lru
        );
        assert_eq!("".parse::<EvictionPolicy>().unwrap(), EvictionPolicy::Lru);
    }

    #[test]
    fn test_event_serializes() {
        let event = CacheEvent::ItemRemoved {
            key: "k".to_string(),
            region: Some("r".to_string()),
            reason: RemovalReason::Evicted,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("Evicted"));
    }
}
