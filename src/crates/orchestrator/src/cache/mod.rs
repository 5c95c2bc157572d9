//! Low-latency cache port
//!
//! The cache holds derivative, possibly stale copies of task state, the
//! cooperative cancellation markers, automation locks, and the per-task
//! publish/subscribe channels. It is never authoritative; see
//! [`crate::store::TaskStore`] for the reconciliation rules.

pub mod keys;
pub mod memory;

pub use memory::InMemoryCache;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Cache failures
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The cache could not be reached; callers retry with backoff
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    #[error("Cache serialization error: {0}")]
    Serialization(String),
}

impl CacheError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CacheError::Unavailable(_))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Key-value, list and pub/sub operations the core needs from a cache
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Store a value, optionally expiring after `ttl`
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> CacheResult<()>;

    /// Store only if the key is absent or expired; returns whether it was stored
    async fn set_nx(&self, key: &str, value: String, ttl: Duration) -> CacheResult<bool>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Append to a list, dropping the oldest entries beyond `max_len`
    async fn push_bounded(&self, key: &str, value: String, max_len: usize) -> CacheResult<()>;

    /// Whole list, oldest first
    async fn range(&self, key: &str) -> CacheResult<Vec<String>>;

    /// Publish to a channel; returns the number of live subscribers reached
    async fn publish(&self, channel: &str, payload: String) -> CacheResult<usize>;

    fn subscribe(&self, channel: &str) -> CacheResult<broadcast::Receiver<String>>;

    /// Drop a channel; its subscribers see it closed once drained
    async fn close_channel(&self, channel: &str) -> CacheResult<()>;

    /// Evict every expired entry; returns how many were removed
    async fn purge_expired(&self) -> CacheResult<usize>;
}
