//! Key-value store abstraction.
//!
//! [`KvStore`] is the narrow surface every feature needs from the shared backend:
//! TTL'd writes, atomic increment, set-if-absent, get-and-delete and bounded prefix
//! scans. The backend is injected, so callers decide how to react when it fails:
//! rate limits fail open, secrets fall back to a [`MemoryStore`], the cache misses.

mod fallback;
mod memory;
mod redis_store;

pub use fallback::{FallbackStore, DEFAULT_PRIMARY_DEADLINE};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use std::{future::Future, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("key-value backend unavailable: {0}")]
    Unavailable(String),
    #[error("key-value operation timed out")]
    Timeout,
    #[error("value at {key} is not usable: {reason}")]
    Corrupt { key: String, reason: String },
}

/// One page of a prefix scan. `next_cursor == 0` means the scan is complete.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanPage {
    pub keys: Vec<String>,
    pub next_cursor: u64,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Store `value`. `None` keeps the entry until it is deleted.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), KvError>;

    /// Returns `true` only for the caller that created the key.
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration)
        -> Result<bool, KvError>;

    /// Atomically add one, creating the key at 1 when absent.
    async fn increment(&self, key: &str) -> Result<i64, KvError>;

    /// [`KvStore::increment`] that gives a newly created key `ttl` in the same atomic step,
    /// so a counter is never left without an expiry.
    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, KvError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError>;

    /// Fetch and remove in one atomic step.
    async fn get_and_delete(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    async fn exists(&self, key: &str) -> Result<bool, KvError>;

    async fn scan_prefix(&self, prefix: &str, cursor: u64, count: usize)
        -> Result<ScanPage, KvError>;

    async fn delete_many(&self, keys: &[String]) -> Result<u64, KvError>;

    async fn ping(&self) -> Result<(), KvError>;
}

/// Run `fut` under `deadline`, folding an elapsed deadline into [`KvError::Timeout`].
///
/// # Errors
/// Returns the inner error, or `Timeout` when the deadline passes first.
pub async fn bounded<T, F>(deadline: Duration, fut: F) -> Result<T, KvError>
where
    F: Future<Output = Result<T, KvError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(KvError::Timeout),
    }
}
