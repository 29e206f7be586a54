//! Error types for the caching layer
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the caching layer.
///
/// Backend unavailability in the Redis provider is deliberately *not* a
/// variant here: the provider degrades those failures to the operation's
/// "nothing happened" result instead of propagating them.
#[derive(Error, Debug)]
pub enum CacheError {
    /// A required key, tag or region argument was blank
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The value-producing factory failed during get_or_create/warmup
    #[error("Factory failed: {0}")]
    Factory(#[source] anyhow::Error),

    /// Remote connection could not be established (fatal for that provider)
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Value could not be serialized or deserialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A cached value exists but cannot be read as the requested type
    #[error("Type mismatch for key '{key}': stored value is not a {expected}")]
    TypeMismatch {
        /// The cache key that was read
        key: String,
        /// The requested type name
        expected: &'static str,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

// == Result Type Alias ==
/// Convenience Result type for the caching layer.
pub type Result<T> = std::result::Result<T, CacheError>;
