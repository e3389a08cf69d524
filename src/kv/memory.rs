use super::{KvError, KvStore, ScanPage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{collections::HashMap, time::Duration};
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
    // Insertion order, used as the scan cursor so deletions never shift a scan.
    seq: u64,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

impl Inner {
    fn live_value(&mut self, key: &str, now: Instant) -> Option<Vec<u8>> {
        match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert or overwrite, keeping the sequence number of a key that is still live.
    fn put(&mut self, key: &str, value: Vec<u8>, expires_at: Option<Instant>, now: Instant) {
        let seq = match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => entry.seq,
            _ => {
                self.next_seq += 1;
                self.next_seq
            }
        };
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at,
                seq,
            },
        );
    }
}

/// Process-local store guarded by a single mutex.
///
/// Entries expire lazily on access; [`MemoryStore::purge_expired`] reclaims the rest and is
/// driven by the periodic sweeper. State held here is invisible to other instances.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| entry.is_live(now));
        before - inner.entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add one to `key`. A key created here expires after `ttl`; an existing key keeps
    /// its expiry.
    fn add_one(&self, key: &str, ttl: Option<Duration>) -> Result<i64, KvError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let (current, expires_at) = match inner.entries.get(key) {
            Some(entry) if entry.is_live(now) => {
                let text = std::str::from_utf8(&entry.value).map_err(|e| KvError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?;
                let current = text.parse::<i64>().map_err(|e| KvError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?;
                (current, entry.expires_at)
            }
            _ => (0, ttl.map(|ttl| now + ttl)),
        };
        let next = current.checked_add(1).ok_or_else(|| KvError::Corrupt {
            key: key.to_string(),
            reason: "increment would overflow".to_string(),
        })?;
        inner.put(key, next.to_string().into_bytes(), expires_at, now);
        Ok(next)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.inner.lock().live_value(key, Instant::now()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), KvError> {
        let now = Instant::now();
        self.inner
            .lock()
            .put(key, value.to_vec(), ttl.map(|ttl| now + ttl), now);
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner.live_value(key, now).is_some() {
            return Ok(false);
        }
        inner.put(key, value.to_vec(), Some(now + ttl), now);
        Ok(true)
    }

    async fn increment(&self, key: &str) -> Result<i64, KvError> {
        self.add_one(key, None)
    }

    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, KvError> {
        self.add_one(key, Some(ttl))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_and_delete(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let now = Instant::now();
        Ok(self
            .inner
            .lock()
            .entries
            .remove(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value))
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.inner.lock().live_value(key, Instant::now()).is_some())
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
        cursor: u64,
        count: usize,
    ) -> Result<ScanPage, KvError> {
        let now = Instant::now();
        let inner = self.inner.lock();
        let mut matching: Vec<(u64, &String)> = inner
            .entries
            .iter()
            .filter(|(key, entry)| {
                entry.seq >= cursor && key.starts_with(prefix) && entry.is_live(now)
            })
            .map(|(key, entry)| (entry.seq, key))
            .collect();
        matching.sort_unstable();

        let take = count.max(1);
        let next_cursor = if matching.len() > take {
            matching[take].0
        } else {
            0
        };
        let keys = matching
            .into_iter()
            .take(take)
            .map(|(_, key)| key.clone())
            .collect();

        Ok(ScanPage { keys, next_cursor })
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, KvError> {
        let mut inner = self.inner.lock();
        let removed = keys
            .iter()
            .filter(|key| inner.entries.remove(key.as_str()).is_some())
            .count();
        Ok(removed as u64)
    }

    async fn ping(&self) -> Result<(), KvError> {
        Ok(())
    }
}
