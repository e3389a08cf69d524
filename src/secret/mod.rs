//! One-time secrets.
//!
//! A secret is stored under a namespaced key with a TTL and can be verified successfully at
//! most once: [`SecretStore::verify_and_consume`] fetches and deletes in a single atomic
//! step, so concurrent attempts on the same key see the value at most once between them.
//! Email codes, CAPTCHA answers ([`CaptchaStore`]) and OAuth state ([`StateStore`]) are all
//! built on this.

mod captcha;
mod state;

pub use captcha::{CaptchaChallenge, CaptchaStore, CAPTCHA_TTL};
pub use state::{StateStore, STATE_TTL};

use crate::kv::{bounded, KvError, KvStore};
use rand::{rngs::OsRng, RngCore};
use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::warn;

pub const DEFAULT_CODE_LENGTH: usize = 6;
const DEFAULT_DEADLINE: Duration = Duration::from_millis(500);

/// Where the digits of a generated code came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeSource {
    Secure,
    /// Derived from the clock after the OS random source failed. Predictable.
    TimeDerived,
}

/// Generate a numeric code of `len` digits (six when `len` is zero).
#[must_use]
pub fn generate_code(len: usize) -> String {
    generate_code_from(&mut OsRng, len).0
}

/// Generate a numeric code using `rng`, falling back to clock-derived digits if it fails.
pub fn generate_code_from<R: RngCore>(rng: &mut R, len: usize) -> (String, CodeSource) {
    let len = if len == 0 { DEFAULT_CODE_LENGTH } else { len };
    match random_digits(rng, len) {
        Ok(code) => (code, CodeSource::Secure),
        Err(err) => {
            warn!(error = %err, "secure random source failed, using time-derived code");
            (time_digits(len), CodeSource::TimeDerived)
        }
    }
}

fn random_digits<R: RngCore>(rng: &mut R, len: usize) -> Result<String, rand::Error> {
    let mut code = String::with_capacity(len);
    let mut buf = [0u8; 32];
    while code.len() < len {
        rng.try_fill_bytes(&mut buf)?;
        // Bytes >= 250 would bias the distribution towards 0..=5.
        for byte in buf.iter().copied().filter(|b| *b < 250) {
            if code.len() == len {
                break;
            }
            code.push(char::from(b'0' + byte % 10));
        }
    }
    Ok(code)
}

fn time_digits(len: usize) -> String {
    let mut seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    let mut code = String::with_capacity(len);
    for _ in 0..len {
        seed = seed
            .wrapping_mul(0x5851_f42d_4c95_7f2d)
            .wrapping_add(0x1405_7b7e_f767_814f);
        let digit = u8::try_from((seed >> 64) % 10).unwrap_or(0);
        code.push(char::from(b'0' + digit));
    }
    code
}

/// Namespaced one-time secrets with cooldown locks.
#[derive(Clone)]
pub struct SecretStore {
    kv: Arc<dyn KvStore>,
    secret_prefix: String,
    cooldown_prefix: String,
    deadline: Duration,
}

impl SecretStore {
    /// Secrets live under `{namespace}:{id}`; cooldowns under `cooldown:{namespace}:{id}`.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, namespace: &str) -> Self {
        Self {
            kv,
            secret_prefix: format!("{namespace}:"),
            cooldown_prefix: format!("cooldown:{namespace}:"),
            deadline: DEFAULT_DEADLINE,
        }
    }

    /// Email verification codes (`verify:email:*`, cooldowns under `cooldown:email:*`).
    #[must_use]
    pub fn email_codes(kv: Arc<dyn KvStore>) -> Self {
        Self::new(kv, "verify:email").with_cooldown_namespace("email")
    }

    #[must_use]
    pub fn with_cooldown_namespace(mut self, namespace: &str) -> Self {
        self.cooldown_prefix = format!("cooldown:{namespace}:");
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    fn secret_key(&self, id: &str) -> String {
        format!("{}{id}", self.secret_prefix)
    }

    fn cooldown_key(&self, id: &str) -> String {
        format!("{}{id}", self.cooldown_prefix)
    }

    /// # Errors
    /// Returns an error if the backing store rejects the write.
    pub async fn save(&self, id: &str, secret: &str, ttl: Duration) -> Result<(), KvError> {
        bounded(
            self.deadline,
            self.kv.set(&self.secret_key(id), secret.as_bytes(), Some(ttl)),
        )
        .await
    }

    /// Consume the secret stored for `id` and compare it with `candidate`.
    ///
    /// The secret is gone afterwards whether or not it matched.
    pub async fn verify_and_consume(&self, id: &str, candidate: &str) -> bool {
        if id.is_empty() || candidate.is_empty() {
            return false;
        }
        match bounded(self.deadline, self.kv.get_and_delete(&self.secret_key(id))).await {
            Ok(Some(stored)) => stored == candidate.as_bytes(),
            Ok(None) => false,
            Err(err) => {
                warn!(error = %err, "secret lookup failed");
                false
            }
        }
    }

    /// Compare without consuming. Only for optimistic pre-checks.
    pub async fn verify_without_consuming(&self, id: &str, candidate: &str) -> bool {
        if id.is_empty() || candidate.is_empty() {
            return false;
        }
        match bounded(self.deadline, self.kv.get(&self.secret_key(id))).await {
            Ok(Some(stored)) => stored == candidate.as_bytes(),
            Ok(None) => false,
            Err(err) => {
                warn!(error = %err, "secret lookup failed");
                false
            }
        }
    }

    /// `true` for the first caller within `window`; everyone else gets `false` until it lapses.
    pub async fn try_acquire_cooldown(&self, id: &str, window: Duration) -> bool {
        if window.is_zero() {
            return true;
        }
        match bounded(
            self.deadline,
            self.kv.set_if_absent(&self.cooldown_key(id), b"1", window),
        )
        .await
        {
            Ok(acquired) => acquired,
            Err(err) => {
                warn!(error = %err, "cooldown lock failed, allowing");
                true
            }
        }
    }
}
