//! Logged-out tokens.
//!
//! A revoked token is remembered until its own expiry and no longer. Keys hold the SHA-256
//! of the token rather than the token itself.

use crate::kv::{bounded, KvError, KvStore};
use sha2::{Digest, Sha256};
use std::{fmt::Write, sync::Arc, time::Duration};
use tracing::warn;

const PREFIX: &str = "jwt:blacklist:";
const DEADLINE: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct RevocationRegistry {
    kv: Arc<dyn KvStore>,
}

fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut key = String::with_capacity(PREFIX.len() + 64);
    key.push_str(PREFIX);
    for byte in digest {
        let _ = write!(key, "{byte:02x}");
    }
    key
}

impl RevocationRegistry {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Revoke `token` until `expires_at` (unix seconds).
    ///
    /// # Errors
    /// Returns an error if the entry cannot be written.
    pub async fn revoke(&self, token: &str, expires_at: i64) -> Result<(), KvError> {
        self.revoke_at(token, expires_at, chrono::Utc::now().timestamp())
            .await
    }

    /// Same as [`RevocationRegistry::revoke`] with an explicit current time. A token that
    /// is already expired is left alone.
    ///
    /// # Errors
    /// Returns an error if the entry cannot be written.
    pub async fn revoke_at(&self, token: &str, expires_at: i64, now: i64) -> Result<(), KvError> {
        let Ok(remaining) = u64::try_from(expires_at.saturating_sub(now)) else {
            return Ok(());
        };
        if remaining == 0 {
            return Ok(());
        }
        bounded(
            DEADLINE,
            self.kv.set(
                &fingerprint(token),
                b"1",
                Some(Duration::from_secs(remaining)),
            ),
        )
        .await
    }

    pub async fn is_revoked(&self, token: &str) -> bool {
        match bounded(DEADLINE, self.kv.exists(&fingerprint(token))).await {
            Ok(found) => found,
            Err(err) => {
                warn!(error = %err, "revocation lookup failed, treating token as active");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{
        testing::{SlowStore, UnavailableStore},
        FallbackStore, MemoryStore,
    };

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn fingerprint_is_stable_and_prefixed() {
        let a = fingerprint("token-a");
        assert!(a.starts_with(PREFIX));
        assert_eq!(a.len(), PREFIX.len() + 64);
        assert_eq!(a, fingerprint("token-a"));
        assert_ne!(a, fingerprint("token-b"));
    }

    #[tokio::test]
    async fn revoked_token_is_reported() -> Result<(), KvError> {
        let registry = RevocationRegistry::new(Arc::new(MemoryStore::new()));
        registry.revoke_at("tok", NOW + 3600, NOW).await?;
        assert!(registry.is_revoked("tok").await);
        assert!(!registry.is_revoked("other").await);
        Ok(())
    }

    #[tokio::test]
    async fn expired_tokens_are_not_stored() -> Result<(), KvError> {
        let store = Arc::new(MemoryStore::new());
        let registry = RevocationRegistry::new(store.clone());
        registry.revoke_at("old", NOW - 1, NOW).await?;
        registry.revoke_at("now", NOW, NOW).await?;
        assert!(store.is_empty());
        assert!(!registry.is_revoked("old").await);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn entry_lapses_with_the_token() -> Result<(), KvError> {
        let registry = RevocationRegistry::new(Arc::new(MemoryStore::new()));
        registry.revoke_at("tok", NOW + 30, NOW).await?;
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!registry.is_revoked("tok").await);
        Ok(())
    }

    #[tokio::test]
    async fn revocation_works_through_local_fallback() -> Result<(), KvError> {
        let kv = Arc::new(FallbackStore::new("revocation", Arc::new(UnavailableStore)));
        let registry = RevocationRegistry::new(kv);
        registry.revoke_at("tok", NOW + 60, NOW).await?;
        assert!(registry.is_revoked("tok").await);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn revocation_survives_a_hanging_backend() -> Result<(), KvError> {
        let kv = Arc::new(FallbackStore::new(
            "revocation",
            Arc::new(SlowStore::new(Duration::from_secs(2))),
        ));
        let registry = RevocationRegistry::new(kv);
        registry.revoke_at("tok", NOW + 60, NOW).await?;
        assert!(registry.is_revoked("tok").await);
        assert!(!registry.is_revoked("other").await);
        Ok(())
    }
}
