use super::SecretStore;
use crate::kv::{KvError, KvStore};
use rand::Rng;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

pub const CAPTCHA_TTL: Duration = Duration::from_secs(10 * 60);

/// What the client gets to see. The answer stays server side.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CaptchaChallenge {
    pub captcha_id: String,
    pub question: String,
}

/// Text CAPTCHA answers stored as one-time secrets under `captcha:*`.
#[derive(Clone)]
pub struct CaptchaStore {
    secrets: SecretStore,
    ttl: Duration,
}

impl CaptchaStore {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            secrets: SecretStore::new(kv, "captcha"),
            ttl: CAPTCHA_TTL,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        if !ttl.is_zero() {
            self.ttl = ttl;
        }
        self
    }

    /// # Errors
    /// Returns an error if the answer cannot be stored.
    pub async fn issue(&self) -> Result<CaptchaChallenge, KvError> {
        let (question, answer) = {
            let mut rng = rand::thread_rng();
            let a: u8 = rng.gen_range(1..=20);
            let b: u8 = rng.gen_range(1..=20);
            (format!("{a} + {b} = ?"), (a + b).to_string())
        };
        let captcha_id = Uuid::new_v4().simple().to_string();
        self.secrets.save(&captcha_id, &answer, self.ttl).await?;
        Ok(CaptchaChallenge {
            captcha_id,
            question,
        })
    }

    /// Consume the challenge; it cannot be answered again.
    pub async fn verify(&self, captcha_id: &str, answer: &str) -> bool {
        self.secrets
            .verify_and_consume(captcha_id, answer.trim())
            .await
    }

    /// Check the answer without consuming the challenge.
    pub async fn check(&self, captcha_id: &str, answer: &str) -> bool {
        self.secrets
            .verify_without_consuming(captcha_id, answer.trim())
            .await
    }

    #[cfg(test)]
    pub(crate) async fn save_answer(&self, captcha_id: &str, answer: &str) -> Result<(), KvError> {
        self.secrets.save(captcha_id, answer, self.ttl).await
    }
}
