//! Read-through response cache.
//!
//! Values are serialized once and stored as bytes with a TTL. Every backend failure is
//! treated as a miss, so the cache can only cost performance, never correctness.
//! Invalidation works on key prefixes (see [`keys`]) and is bounded: at most
//! [`MAX_SCAN_ROUNDS`] scan pages within [`INVALIDATE_DEADLINE`]. Anything left over
//! ages out through its TTL.

pub mod keys;

use crate::kv::{bounded, KvError, KvStore};
use serde::{de::DeserializeOwned, Serialize};
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, warn};

pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);
pub const MAX_SCAN_ROUNDS: usize = 10;
pub const SCAN_COUNT: usize = 1000;
pub const INVALIDATE_DEADLINE: Duration = Duration::from_secs(3);
const OP_DEADLINE: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct ResponseCache {
    kv: Arc<dyn KvStore>,
    default_ttl: Duration,
}

impl ResponseCache {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            default_ttl: DEFAULT_TTL,
        }
    }

    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        if !ttl.is_zero() {
            self.default_ttl = ttl;
        }
        self
    }

    pub async fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        match bounded(OP_DEADLINE, self.kv.get(key)).await {
            Ok(value) => value,
            Err(err) => {
                debug!(key, error = %err, "cache read failed, treating as miss");
                None
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get_bytes(key).await?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, error = %err, "discarding undecodable cache entry");
                None
            }
        }
    }

    /// Store raw bytes. `None` uses the default TTL.
    pub async fn set_bytes(&self, key: &str, value: &[u8], ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        if let Err(err) = bounded(OP_DEADLINE, self.kv.set(key, value, Some(ttl))).await {
            debug!(key, error = %err, "cache write failed");
        }
    }

    /// Serialize once and store. Returns the stored bytes so callers can reuse them.
    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Option<Vec<u8>> {
        match serde_json::to_vec(value) {
            Ok(bytes) => {
                self.set_bytes(key, &bytes, ttl).await;
                Some(bytes)
            }
            Err(err) => {
                warn!(key, error = %err, "failed to serialize cache entry");
                None
            }
        }
    }

    /// Return the cached value for `key`, or compute, store and return it.
    ///
    /// `key == None` bypasses the cache entirely. Errors from `compute` are never cached.
    ///
    /// # Errors
    /// Returns whatever `compute` returns.
    pub async fn read_through<T, E, F, Fut>(
        &self,
        key: Option<&str>,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(key) = key else {
            return compute().await;
        };
        if let Some(hit) = self.get_json(key).await {
            return Ok(hit);
        }
        let value = compute().await?;
        self.set_json(key, &value, None).await;
        Ok(value)
    }

    /// Delete every key starting with `prefix`, within the scan and time budget.
    /// Returns how many keys were removed.
    pub async fn invalidate_prefix(&self, prefix: &str) -> u64 {
        match bounded(INVALIDATE_DEADLINE, self.sweep(prefix)).await {
            Ok(removed) => {
                debug!(prefix, removed, "cache prefix invalidated");
                removed
            }
            Err(err) => {
                warn!(prefix, error = %err, "cache invalidation incomplete");
                0
            }
        }
    }

    pub async fn invalidate(&self, mutation: &keys::Mutation) -> u64 {
        let mut removed = 0;
        for prefix in mutation.prefixes() {
            removed += self.invalidate_prefix(&prefix).await;
        }
        removed
    }

    async fn sweep(&self, prefix: &str) -> Result<u64, KvError> {
        let mut cursor = 0;
        let mut removed = 0;
        for _ in 0..MAX_SCAN_ROUNDS {
            let page = self.kv.scan_prefix(prefix, cursor, SCAN_COUNT).await?;
            if !page.keys.is_empty() {
                removed += self.kv.delete_many(&page.keys).await?;
            }
            cursor = page.next_cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{testing::UnavailableStore, MemoryStore};
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Profile {
        id: u64,
        name: String,
    }

    fn cache() -> ResponseCache {
        ResponseCache::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn set_json_is_readable_as_bytes() {
        let cache = cache();
        let profile = Profile {
            id: 1,
            name: "alice".to_string(),
        };
        let stored = cache.set_json(&keys::user_public(1), &profile, None).await;
        let hit = cache.get_bytes(&keys::user_public(1)).await;
        assert_eq!(hit, stored);
        assert_eq!(hit, serde_json::to_vec(&profile).ok());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_with_their_ttl() {
        let cache = cache().with_default_ttl(Duration::from_secs(30));
        cache.set_bytes("cache:x:1", b"v", None).await;
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cache.get_bytes("cache:x:1").await, None);
    }

    #[tokio::test]
    async fn prefix_invalidation_removes_matching_keys_only() {
        let cache = cache();
        cache.set_bytes(&keys::post_detail(1), b"a", None).await;
        cache.set_bytes(&keys::post_detail(10), b"b", None).await;
        cache.set_bytes(&keys::user_public(1), b"c", None).await;

        assert_eq!(cache.invalidate_prefix(&keys::post_prefix(1)).await, 1);
        assert_eq!(cache.get_bytes(&keys::post_detail(1)).await, None);
        assert!(cache.get_bytes(&keys::post_detail(10)).await.is_some());
        assert!(cache.get_bytes(&keys::user_public(1)).await.is_some());
    }

    #[tokio::test]
    async fn invalidation_stops_after_the_round_cap() {
        let store = Arc::new(MemoryStore::new());
        let cache = ResponseCache::new(store.clone());
        let total = MAX_SCAN_ROUNDS * SCAN_COUNT + 5;
        for i in 0..total {
            cache.set_bytes(&format!("cache:bulk:{i}"), b"x", None).await;
        }
        let removed = cache.invalidate_prefix("cache:bulk:").await;
        assert_eq!(removed, (MAX_SCAN_ROUNDS * SCAN_COUNT) as u64);
        assert_eq!(store.len(), 5);
    }

    #[tokio::test]
    async fn mutation_invalidates_every_affected_view() {
        let cache = cache();
        let list = keys::post_list(None, 1, 10, None).unwrap_or_default();
        cache.set_bytes(&list, b"list", None).await;
        cache.set_bytes(&keys::post_detail(3), b"detail", None).await;
        cache.set_bytes(&keys::user_posts(7, 1, 10), b"mine", None).await;

        let removed = cache
            .invalidate(&keys::Mutation::Post {
                post_id: 3,
                author_id: 7,
            })
            .await;
        assert_eq!(removed, 3);
        assert_eq!(cache.get_bytes(&list).await, None);
    }

    #[tokio::test]
    async fn read_through_computes_once() {
        let cache = cache();
        let key = keys::user_public(1);
        let first: Result<Profile, ()> = cache
            .read_through(Some(&key), || async {
                Ok(Profile {
                    id: 1,
                    name: "alice".to_string(),
                })
            })
            .await;
        let second: Result<Profile, ()> = cache
            .read_through(Some(&key), || async { Err(()) })
            .await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn read_through_without_key_always_computes() {
        let cache = cache();
        let result: Result<u32, ()> = cache.read_through(None, || async { Ok(1) }).await;
        assert_eq!(result, Ok(1));
        let result: Result<u32, ()> = cache.read_through(None, || async { Err(()) }).await;
        assert_eq!(result, Err(()));
    }

    #[tokio::test]
    async fn backend_failure_is_a_miss() {
        let cache = ResponseCache::new(Arc::new(UnavailableStore));
        cache.set_bytes("k", b"v", None).await;
        assert_eq!(cache.get_bytes("k").await, None);
        assert_eq!(cache.invalidate_prefix("k").await, 0);
        let result: Result<u32, ()> = cache.read_through(Some("k"), || async { Ok(5) }).await;
        assert_eq!(result, Ok(5));
    }
}
