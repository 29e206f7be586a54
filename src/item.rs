//! Cache Item Module
//!
//! Defines the stored unit: a type-erased value plus key, region, tags,
//! expiration and access telemetry.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// == Cache Item ==
/// Represents a single cache item with value and metadata.
///
/// The payload is kept type-erased as a JSON value together with the name
/// of the type it was written as; typed reads deserialize through serde and
/// report a type mismatch distinctly from "not present".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheItem {
    /// Logical identifier, unique within a region
    pub key: String,
    /// Optional namespace partition
    pub region: Option<String>,
    /// Type-erased payload
    pub value: serde_json::Value,
    /// Name of the Rust type the payload was written as
    pub type_name: String,
    /// Secondary index labels for bulk invalidation
    #[serde(default)]
    pub tags: HashSet<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last access timestamp, bumped on every hit
    pub last_accessed_at: DateTime<Utc>,
    /// Monotonic access counter
    pub access_count: u64,
    /// Absolute expiry; None means "use provider default expiration"
    pub expires_at: Option<DateTime<Utc>>,
    /// Serialized size estimate, populated only when size tracking is enabled
    pub size_in_bytes: Option<u64>,
}

impl CacheItem {
    // == Constructor ==
    /// Creates a new cache item with optional expiration.
    pub fn new(
        key: impl Into<String>,
        region: Option<String>,
        value: serde_json::Value,
        type_name: impl Into<String>,
        tags: HashSet<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            region,
            value,
            type_name: type_name.into(),
            tags,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            expires_at,
            size_in_bytes: None,
        }
    }

    // == Is Expired ==
    /// Checks if the item has expired.
    ///
    /// Boundary condition: an item is expired when the current time is
    /// at-or-after the expiration time. An item without an expiration is
    /// never expired by this check.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires) => Utc::now() >= expires,
            None => false,
        }
    }

    // == Time To Live ==
    /// Returns remaining TTL, or None if no expiration is set.
    ///
    /// Returns a zero duration if the item has already expired.
    pub fn ttl_remaining(&self) -> Option<Duration> {
        self.expires_at.map(|expires| {
            let remaining = expires - Utc::now();
            if remaining > Duration::zero() {
                remaining
            } else {
                Duration::zero()
            }
        })
    }

    // == Mark Accessed ==
    /// Bumps access telemetry: last-access timestamp and access counter.
    pub fn mark_accessed(&mut self) {
        self.last_accessed_at = Utc::now();
        self.access_count += 1;
    }

    // == Composite Key ==
    /// Returns the storage key: `region:key`, or bare `key` when region is absent.
    pub fn composite_key(&self) -> String {
        composite_key(&self.key, self.region.as_deref())
    }

    /// Estimates the serialized size of this item in bytes.
    ///
    /// Returns None when the item cannot be serialized; callers treat that
    /// as "size tracking unavailable for this item", not as a failure.
    pub fn estimate_size(&self) -> Option<u64> {
        serde_json::to_vec(self).ok().map(|b| b.len() as u64)
    }
}

// == Composite Key Helpers ==
/// Builds the composite storage key from a key and optional region.
pub fn composite_key(key: &str, region: Option<&str>) -> String {
    match region {
        Some(region) => format!("{}:{}", region, key),
        None => key.to_string(),
    }
}

/// Returns true if a composite key belongs to the given region.
pub fn key_in_region(composite: &str, region: &str) -> bool {
    composite
        .strip_prefix(region)
        .and_then(|rest| rest.strip_prefix(':'))
        .is_some()
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn item(key: &str, region: Option<&str>, ttl_secs: Option<i64>) -> CacheItem {
        CacheItem::new(
            key,
            region.map(String::from),
            serde_json::json!("payload"),
            "alloc::string::String",
            HashSet::new(),
            ttl_secs.map(|s| Utc::now() + Duration::seconds(s)),
        )
    }

    #[test]
    fn test_item_creation_no_expiry() {
        let item = item("k", None, None);
        assert!(item.expires_at.is_none());
        assert!(!item.is_expired());
        assert!(item.ttl_remaining().is_none());
        assert_eq!(item.access_count, 0);
    }

    #[test]
    fn test_item_expiration() {
        let mut item = item("k", None, Some(3600));
        assert!(!item.is_expired());

        // Force the boundary: expires exactly now
        item.expires_at = Some(Utc::now());
        sleep(std::time::Duration::from_millis(5));
        assert!(item.is_expired(), "item should be expired at boundary");
        assert_eq!(item.ttl_remaining(), Some(Duration::zero()));
    }

    #[test]
    fn test_ttl_remaining() {
        let item = item("k", None, Some(10));
        let remaining = item.ttl_remaining().unwrap();
        assert!(remaining <= Duration::seconds(10));
        assert!(remaining >= Duration::seconds(9));
    }

    #[test]
    fn test_mark_accessed() {
        let mut item = item("k", None, None);
        let before = item.last_accessed_at;
        sleep(std::time::Duration::from_millis(5));

        item.mark_accessed();
        assert_eq!(item.access_count, 1);
        assert!(item.last_accessed_at > before);
    }

    #[test]
    fn test_composite_key() {
        assert_eq!(item("k1", None, None).composite_key(), "k1");
        assert_eq!(item("k1", Some("reports"), None).composite_key(), "reports:k1");
        assert_eq!(composite_key("k", Some("r")), "r:k");
        assert_eq!(composite_key("k", None), "k");
    }

    #[test]
    fn test_key_in_region() {
        assert!(key_in_region("reports:k1", "reports"));
        assert!(!key_in_region("reports:k1", "report"));
        assert!(!key_in_region("k1", "reports"));
        assert!(!key_in_region("reportsk1", "reports"));
    }

    #[test]
    fn test_serde_round_trip_preserves_metadata() {
        let mut item = item("k", Some("r"), Some(60));
        item.tags.insert("t1".to_string());
        item.mark_accessed();

        let json = serde_json::to_string(&item).unwrap();
        let back: CacheItem = serde_json::from_str(&json).unwrap();

        assert_eq!(back.key, "k");
        assert_eq!(back.region.as_deref(), Some("r"));
        assert_eq!(back.access_count, 1);
        assert!(back.tags.contains("t1"));
        assert_eq!(back.expires_at, item.expires_at);
    }

    #[test]
    fn test_estimate_size() {
        let item = item("k", None, None);
        let size = item.estimate_size().unwrap();
        assert!(size > 0);
    }
}
