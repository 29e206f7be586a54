//! Provider Implementations Module
//!
//! The two backing stores: a process-local concurrent map and a Redis
//! delegate. Both implement the `CacheProvider` trait.

mod memory;
mod redis;


pub use memory::InMemoryProvider;
pub use redis::RedisProvider;
