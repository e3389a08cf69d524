use super::{bounded, KvError, KvStore, MemoryStore, ScanPage};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tracing::warn;

/// Time the primary gets before a call is answered locally. Kept below the deadlines
/// callers put around a whole store operation.
pub const DEFAULT_PRIMARY_DEADLINE: Duration = Duration::from_millis(250);

/// Shared store with a process-local safety net.
///
/// Any primary failure, including a primary call that outlives the primary deadline, is
/// logged and the call is answered by the local [`MemoryStore`].
/// Entries written locally during an outage stay local; they are not replayed into the
/// primary once it recovers.
pub struct FallbackStore {
    name: &'static str,
    primary: Arc<dyn KvStore>,
    primary_deadline: Duration,
    local: Arc<MemoryStore>,
}

impl FallbackStore {
    #[must_use]
    pub fn new(name: &'static str, primary: Arc<dyn KvStore>) -> Self {
        Self {
            name,
            primary,
            primary_deadline: DEFAULT_PRIMARY_DEADLINE,
            local: Arc::new(MemoryStore::new()),
        }
    }

    #[must_use]
    pub fn with_primary_deadline(mut self, deadline: Duration) -> Self {
        self.primary_deadline = deadline;
        self
    }

    /// Handle on the local map, used by the sweeper.
    #[must_use]
    pub fn local(&self) -> Arc<MemoryStore> {
        Arc::clone(&self.local)
    }

    fn degraded(&self, op: &'static str, err: &KvError) {
        warn!(
            store = self.name,
            op,
            error = %err,
            "key-value backend failed, using local fallback"
        );
    }
}

#[async_trait]
impl KvStore for FallbackStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        match bounded(self.primary_deadline, self.primary.get(key)).await {
            Ok(value) => Ok(value),
            Err(err) => {
                self.degraded("get", &err);
                self.local.get(key).await
            }
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), KvError> {
        match bounded(self.primary_deadline, self.primary.set(key, value, ttl)).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.degraded("set", &err);
                self.local.set(key, value, ttl).await
            }
        }
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let primary = self.primary.set_if_absent(key, value, ttl);
        match bounded(self.primary_deadline, primary).await {
            Ok(created) => Ok(created),
            Err(err) => {
                self.degraded("set_if_absent", &err);
                self.local.set_if_absent(key, value, ttl).await
            }
        }
    }

    async fn increment(&self, key: &str) -> Result<i64, KvError> {
        match bounded(self.primary_deadline, self.primary.increment(key)).await {
            Ok(n) => Ok(n),
            Err(err) => {
                self.degraded("increment", &err);
                self.local.increment(key).await
            }
        }
    }

    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, KvError> {
        match bounded(self.primary_deadline, self.primary.increment_with_ttl(key, ttl)).await {
            Ok(n) => Ok(n),
            Err(err) => {
                self.degraded("increment_with_ttl", &err);
                self.local.increment_with_ttl(key, ttl).await
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        match bounded(self.primary_deadline, self.primary.expire(key, ttl)).await {
            Ok(applied) => Ok(applied),
            Err(err) => {
                self.degraded("expire", &err);
                self.local.expire(key, ttl).await
            }
        }
    }

    async fn get_and_delete(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        match bounded(self.primary_deadline, self.primary.get_and_delete(key)).await {
            Ok(value) => Ok(value),
            Err(err) => {
                self.degraded("get_and_delete", &err);
                self.local.get_and_delete(key).await
            }
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        match bounded(self.primary_deadline, self.primary.exists(key)).await {
            Ok(found) => Ok(found),
            Err(err) => {
                self.degraded("exists", &err);
                self.local.exists(key).await
            }
        }
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
        cursor: u64,
        count: usize,
    ) -> Result<ScanPage, KvError> {
        let primary = self.primary.scan_prefix(prefix, cursor, count);
        match bounded(self.primary_deadline, primary).await {
            Ok(page) => Ok(page),
            Err(err) => {
                self.degraded("scan_prefix", &err);
                self.local.scan_prefix(prefix, cursor, count).await
            }
        }
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, KvError> {
        match bounded(self.primary_deadline, self.primary.delete_many(keys)).await {
            Ok(n) => Ok(n),
            Err(err) => {
                self.degraded("delete_many", &err);
                self.local.delete_many(keys).await
            }
        }
    }

    async fn ping(&self) -> Result<(), KvError> {
        self.primary.ping().await
    }
}
