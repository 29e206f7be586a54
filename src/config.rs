//! Configuration Module
//!
//! Handles loading and managing cache configuration from environment variables.

use std::env;

/// Cache layer configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Default TTL in seconds for items without explicit expiration
    pub default_ttl: u64,
    /// Identifier of the provider the manager should select
    pub default_provider: String,
    /// Whether providers estimate and track per-item sizes
    pub track_sizes: bool,
    /// Background maintenance interval in seconds
    pub maintenance_interval: u64,
    /// In-memory provider settings
    pub memory: MemoryConfig,
    /// Redis provider settings
    pub redis: RedisConfig,
}

/// In-memory provider settings.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Maximum tracked size in bytes before eviction runs (0 = unbounded)
    pub max_size_bytes: u64,
    /// Fraction of capacity to free below the limit on an eviction pass
    pub compaction_percentage: f64,
    /// Eviction policy name: "lru", "lfu" or "fifo" (unknown names fall back to LRU)
    pub eviction_policy: String,
}

/// Redis provider settings.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Connection URL, e.g. "redis://127.0.0.1:6379"
    pub url: String,
    /// Database index selected after connecting
    pub database: i64,
    /// Prefix prepended to every stored key
    pub key_prefix: String,
    /// Number of connection attempts before initialization fails
    pub connect_retries: u32,
    /// Delay between connection attempts in milliseconds
    pub retry_delay_ms: u64,
}

impl CacheConfig {
    /// Creates a new CacheConfig by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_DEFAULT_TTL` - Default TTL in seconds (default: 300)
    /// - `CACHE_DEFAULT_PROVIDER` - Provider id to select (default: "memory")
    /// - `CACHE_TRACK_SIZES` - Enable size tracking (default: true)
    /// - `CACHE_MAINTENANCE_INTERVAL` - Maintenance frequency in seconds (default: 60)
    /// - `CACHE_MAX_SIZE_BYTES` - In-memory size limit (default: 67108864)
    /// - `CACHE_COMPACTION_PERCENTAGE` - Eviction headroom fraction (default: 0.2)
    /// - `CACHE_EVICTION_POLICY` - "lru", "lfu" or "fifo" (default: "lru")
    /// - `REDIS_URL` - Redis connection URL (default: "redis://127.0.0.1:6379")
    /// - `REDIS_DATABASE` - Redis database index (default: 0)
    /// - `REDIS_KEY_PREFIX` - Key namespace prefix (default: "report-cache:")
    /// - `REDIS_CONNECT_RETRIES` - Connection attempts (default: 3)
    /// - `REDIS_RETRY_DELAY_MS` - Delay between attempts (default: 200)
    pub fn from_env() -> Self {
        Self {
            default_ttl: env_parse("CACHE_DEFAULT_TTL", 300),
            default_provider: env::var("CACHE_DEFAULT_PROVIDER")
                .unwrap_or_else(|_| "memory".to_string()),
            track_sizes: env_parse("CACHE_TRACK_SIZES", true),
            maintenance_interval: env_parse("CACHE_MAINTENANCE_INTERVAL", 60),
            memory: MemoryConfig {
                max_size_bytes: env_parse("CACHE_MAX_SIZE_BYTES", 64 * 1024 * 1024),
                compaction_percentage: env_parse("CACHE_COMPACTION_PERCENTAGE", 0.2),
                eviction_policy: env::var("CACHE_EVICTION_POLICY")
                    .unwrap_or_else(|_| "lru".to_string()),
            },
            redis: RedisConfig {
                url: env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
                database: env_parse("REDIS_DATABASE", 0),
                key_prefix: env::var("REDIS_KEY_PREFIX")
                    .unwrap_or_else(|_| "report-cache:".to_string()),
                connect_retries: env_parse("REDIS_CONNECT_RETRIES", 3),
                retry_delay_ms: env_parse("REDIS_RETRY_DELAY_MS", 200),
            },
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: 300,
            default_provider: "memory".to_string(),
            track_sizes: true,
            maintenance_interval: 60,
            memory: MemoryConfig::default(),
            redis: RedisConfig::default(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 64 * 1024 * 1024,
            compaction_percentage: 0.2,
            eviction_policy: "lru".to_string(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            database: 0,
            key_prefix: "report-cache:".to_string(),
            connect_retries: 3,
            retry_delay_ms: 200,
        }
    }
}

/// Parses an environment variable, falling back to a default on absence or parse failure.
fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = CacheConfig::default();
        assert_eq!(config.default_ttl, 300);
        assert_eq!(config.default_provider, "memory");
        assert!(config.track_sizes);
        assert_eq!(config.memory.max_size_bytes, 64 * 1024 * 1024);
        assert_eq!(config.memory.eviction_policy, "lru");
        assert_eq!(config.redis.url, "redis://127.0.0.1:6379");
        assert_eq!(config.redis.connect_retries, 3);
    }

    #[test]
    fn test_config_from_env_defaults() {
        // Clear any existing env vars to test defaults
        env::remove_var("CACHE_DEFAULT_TTL");
        env::remove_var("CACHE_DEFAULT_PROVIDER");
        env::remove_var("CACHE_MAX_SIZE_BYTES");
        env::remove_var("REDIS_URL");

        let config = CacheConfig::from_env();
        assert_eq!(config.default_ttl, 300);
        assert_eq!(config.default_provider, "memory");
        assert_eq!(config.memory.max_size_bytes, 64 * 1024 * 1024);
        assert_eq!(config.redis.key_prefix, "report-cache:");
    }

    #[test]
    fn test_env_parse_bad_value_falls_back() {
        env::set_var("CACHE_COMPACTION_PERCENTAGE", "not-a-number");
        let config = CacheConfig::from_env();
        assert_eq!(config.memory.compaction_percentage, 0.2);
        env::remove_var("CACHE_COMPACTION_PERCENTAGE");
    }
}
