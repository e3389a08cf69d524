use crate::kv::{bounded, KvError, KvStore};
use std::{sync::Arc, time::Duration};
use tracing::warn;
use uuid::Uuid;

pub const STATE_TTL: Duration = Duration::from_secs(10 * 60);
const DEADLINE: Duration = Duration::from_millis(500);
const PREFIX: &str = "oauth:state:";

/// Single-use OAuth CSRF state tokens.
#[derive(Clone)]
pub struct StateStore {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl StateStore {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv, ttl: STATE_TTL }
    }

    /// A zero TTL keeps the default.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        if !ttl.is_zero() {
            self.ttl = ttl;
        }
        self
    }

    /// # Errors
    /// Returns an error if the state cannot be stored.
    pub async fn issue(&self) -> Result<String, KvError> {
        let state = Uuid::new_v4().simple().to_string();
        bounded(
            DEADLINE,
            self.kv.set(&format!("{PREFIX}{state}"), b"1", Some(self.ttl)),
        )
        .await?;
        Ok(state)
    }

    /// `true` exactly once per issued state.
    pub async fn consume(&self, state: &str) -> bool {
        if state.is_empty() {
            return false;
        }
        match bounded(DEADLINE, self.kv.get_and_delete(&format!("{PREFIX}{state}"))).await {
            Ok(value) => value.is_some_and(|v| !v.is_empty()),
            Err(err) => {
                warn!(error = %err, "oauth state lookup failed");
                false
            }
        }
    }
}
