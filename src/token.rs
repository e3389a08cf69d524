//! HS256 bearer tokens.
//!
//! Tokens are compact JWTs signed with one shared secret. Verification accepts exactly one
//! algorithm: a header naming anything else, `none` included, is rejected before the
//! signature is looked at. Revocation is layered on top by
//! [`crate::revocation::RevocationRegistry`].

use base64ct::{Base64UrlUnpadded, Encoding};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "HS256";
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(72 * 60 * 60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("token expired")]
    Expired,
    #[error("unexpected signing algorithm: {0}")]
    WrongAlgorithm(String),
    #[error("token lifetime must be positive")]
    InvalidTtl,
    #[error("signing key rejected")]
    Key,
    #[error("failed to encode token: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Header {
    alg: String,
    typ: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub user_id: u64,
    pub username: String,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    /// Seconds of validity left at `now`, zero once expired.
    #[must_use]
    pub fn remaining(&self, now: i64) -> u64 {
        u64::try_from(self.exp.saturating_sub(now)).unwrap_or(0)
    }
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, TokenError> {
    let json = serde_json::to_vec(value).map_err(|e| TokenError::Encode(e.to_string()))?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, TokenError> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| TokenError::Malformed)?;
    serde_json::from_slice(&bytes).map_err(|_| TokenError::Malformed)
}

pub struct TokenService {
    secret: SecretString,
    default_ttl: Duration,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

impl TokenService {
    #[must_use]
    pub fn new(secret: SecretString) -> Self {
        Self {
            secret,
            default_ttl: DEFAULT_TOKEN_TTL,
        }
    }

    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        if !ttl.is_zero() {
            self.default_ttl = ttl;
        }
        self
    }

    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn mac(&self) -> Result<HmacSha256, TokenError> {
        HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|_| TokenError::Key)
    }

    /// Issue a token valid for `ttl`, or the default lifetime when `None`.
    ///
    /// # Errors
    /// Returns an error if the lifetime is zero or encoding fails.
    pub fn issue(
        &self,
        user_id: u64,
        username: &str,
        ttl: Option<Duration>,
    ) -> Result<String, TokenError> {
        self.issue_at(user_id, username, ttl, chrono::Utc::now().timestamp())
    }

    /// Same as [`TokenService::issue`] with an explicit issue time.
    ///
    /// # Errors
    /// Returns an error if the lifetime is zero or encoding fails.
    pub fn issue_at(
        &self,
        user_id: u64,
        username: &str,
        ttl: Option<Duration>,
        now: i64,
    ) -> Result<String, TokenError> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let ttl_secs = i64::try_from(ttl.as_secs()).map_err(|_| TokenError::InvalidTtl)?;
        if ttl_secs <= 0 {
            return Err(TokenError::InvalidTtl);
        }

        let header = Header {
            alg: ALGORITHM.to_string(),
            typ: "JWT".to_string(),
        };
        let claims = Claims {
            user_id,
            username: username.to_string(),
            iat: now,
            exp: now.saturating_add(ttl_secs),
        };

        let signing_input = format!("{}.{}", b64e_json(&header)?, b64e_json(&claims)?);
        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        let signature = Base64UrlUnpadded::encode_string(&mac.finalize().into_bytes());

        Ok(format!("{signing_input}.{signature}"))
    }

    /// Verify signature, algorithm and expiry.
    ///
    /// # Errors
    /// Returns `Malformed`, `WrongAlgorithm` or `Expired`.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        self.verify_at(token, chrono::Utc::now().timestamp())
    }

    /// Same as [`TokenService::verify`] at an explicit time.
    ///
    /// # Errors
    /// Returns `Malformed`, `WrongAlgorithm` or `Expired`.
    pub fn verify_at(&self, token: &str, now: i64) -> Result<Claims, TokenError> {
        let mut parts = token.split('.');
        let header_b64 = parts.next().ok_or(TokenError::Malformed)?;
        let claims_b64 = parts.next().ok_or(TokenError::Malformed)?;
        let sig_b64 = parts.next().ok_or(TokenError::Malformed)?;
        if parts.next().is_some() {
            return Err(TokenError::Malformed);
        }

        let header: Header = b64d_json(header_b64)?;
        if header.alg != ALGORITHM {
            return Err(TokenError::WrongAlgorithm(header.alg));
        }

        let signature = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| TokenError::Malformed)?;
        let mut mac = self.mac()?;
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(claims_b64.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::Malformed)?;

        let claims: Claims = b64d_json(claims_b64)?;
        if claims.exp <= now {
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn service() -> TokenService {
        TokenService::new(SecretString::from("unit-test-secret".to_string()))
    }

    #[test]
    fn issue_then_verify_returns_claims() -> Result<(), TokenError> {
        let tokens = service();
        let token = tokens.issue_at(42, "alice", Some(Duration::from_secs(3600)), NOW)?;
        let claims = tokens.verify_at(&token, NOW + 10)?;
        assert_eq!(claims.user_id, 42);
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.iat, NOW);
        assert_eq!(claims.exp, NOW + 3600);
        Ok(())
    }

    #[test]
    fn default_ttl_is_used_when_none_given() -> Result<(), TokenError> {
        let tokens = service();
        let token = tokens.issue_at(1, "bob", None, NOW)?;
        let claims = tokens.verify_at(&token, NOW)?;
        assert_eq!(claims.exp - claims.iat, 72 * 3600);
        Ok(())
    }

    #[test]
    fn expired_tokens_are_rejected() -> Result<(), TokenError> {
        let tokens = service();
        let token = tokens.issue_at(1, "bob", Some(Duration::from_secs(60)), NOW)?;
        assert_eq!(tokens.verify_at(&token, NOW + 61), Err(TokenError::Expired));
        assert_eq!(tokens.verify_at(&token, NOW + 60), Err(TokenError::Expired));
        Ok(())
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let tokens = service();
        assert_eq!(
            tokens.issue_at(1, "bob", Some(Duration::ZERO), NOW),
            Err(TokenError::InvalidTtl)
        );
    }

    #[test]
    fn other_algorithms_are_rejected() -> Result<(), TokenError> {
        let tokens = service();
        let token = tokens.issue_at(1, "bob", Some(Duration::from_secs(60)), NOW)?;
        let mut parts = token.splitn(2, '.');
        let _ = parts.next();
        let rest = parts.next().unwrap_or_default();

        for alg in ["none", "HS512", "RS256"] {
            let header = Base64UrlUnpadded::encode_string(
                format!(r#"{{"alg":"{alg}","typ":"JWT"}}"#).as_bytes(),
            );
            let forged = format!("{header}.{rest}");
            assert_eq!(
                tokens.verify_at(&forged, NOW),
                Err(TokenError::WrongAlgorithm(alg.to_string()))
            );
        }
        Ok(())
    }

    #[test]
    fn tampered_claims_fail_signature_check() -> Result<(), TokenError> {
        let tokens = service();
        let token = tokens.issue_at(1, "bob", Some(Duration::from_secs(60)), NOW)?;
        let parts: Vec<&str> = token.split('.').collect();
        let forged_claims = b64e_json(&Claims {
            user_id: 2,
            username: "mallory".to_string(),
            iat: NOW,
            exp: NOW + 60,
        })?;
        let forged = format!("{}.{}.{}", parts[0], forged_claims, parts[2]);
        assert_eq!(tokens.verify_at(&forged, NOW), Err(TokenError::Malformed));
        Ok(())
    }

    #[test]
    fn tokens_from_another_secret_are_rejected() -> Result<(), TokenError> {
        let other = TokenService::new(SecretString::from("another-secret".to_string()));
        let token = other.issue_at(1, "bob", Some(Duration::from_secs(60)), NOW)?;
        assert_eq!(service().verify_at(&token, NOW), Err(TokenError::Malformed));
        Ok(())
    }

    #[test]
    fn garbage_is_malformed() {
        let tokens = service();
        for token in ["", "abc", "a.b", "a.b.c.d", "!!.??.##"] {
            assert_eq!(tokens.verify_at(token, NOW), Err(TokenError::Malformed));
        }
    }

    #[test]
    fn remaining_saturates_at_zero() {
        let claims = Claims {
            user_id: 1,
            username: "bob".to_string(),
            iat: NOW,
            exp: NOW + 30,
        };
        assert_eq!(claims.remaining(NOW), 30);
        assert_eq!(claims.remaining(NOW + 31), 0);
    }
}
