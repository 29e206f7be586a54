//! Report Cache - a provider-agnostic caching layer
//!
//! Provides typed get-or-create caching with TTL expiration, tag-based
//! invalidation, region partitioning and capacity-bounded eviction, backed
//! by an in-memory store or a remote Redis instance.

pub mod config;
pub mod error;
pub mod events;
pub mod item;
pub mod manager;
pub mod provider;
pub mod providers;
pub mod stats;
pub mod tasks;

pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use events::{CacheEvent, EvictionPolicy, RemovalReason};
pub use item::CacheItem;
pub use manager::CacheManager;
pub use provider::{CacheProvider, ProviderRegistry};
pub use providers::{InMemoryProvider, RedisProvider};
pub use stats::CacheStatistics;
pub use tasks::spawn_maintenance_task;
