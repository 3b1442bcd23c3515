//! # Verimail Store
//!
//! Key-value store adapters used by the verification service. Every piece of
//! shared state (token records, the user index, rate-limit counters) lives
//! behind [`KeyValueStore`] and is mutated only through its atomic
//! primitives:
//!
//! - [`KeyValueStore::compare_and_swap`] for claim transitions
//! - [`KeyValueStore::compare_and_delete`] for commits
//! - [`KeyValueStore::increment_with_ttl`] for rate-limit windows
//!
//! ## Backends
//!
//! - [`InMemoryStore`]: DashMap with clock-driven expiry
//! - [`RedisStore`]: Redis with Lua scripts for the atomic primitives
//! - [`TimeoutStore`]: bounds every call of another store

pub mod memory;
pub mod redis_store;
pub mod timeout;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use verimail_common::VerificationError;

pub use self::memory::InMemoryStore;
pub use self::redis_store::RedisStore;
pub use self::timeout::TimeoutStore;

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store connection error: {0}")]
    Connection(String),

    #[error("Store command failed: {0}")]
    Command(String),

    #[error("Store operation {op} timed out after {after_ms}ms")]
    Timeout { op: &'static str, after_ms: u64 },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<StoreError> for VerificationError {
    fn from(err: StoreError) -> Self {
        VerificationError::StoreUnavailable(err.to_string())
    }
}

/// Key-value store with TTLs and atomic primitives
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get a live value
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set a value that expires after `ttl`
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Delete a key, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Replace the value only if it currently equals `expected`.
    /// The key's remaining TTL is preserved.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
    ) -> Result<bool, StoreError>;

    /// Delete the key only if its value currently equals `expected`
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Atomically increment a counter. The TTL is applied only when the
    /// counter is created, so later increments never extend the window.
    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Remaining TTL of a key, `None` if missing or without expiry
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Live keys starting with `prefix`
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}
