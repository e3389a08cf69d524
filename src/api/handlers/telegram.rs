//! Telegram login widget.
//!
//! The widget hands the browser a payload signed with HMAC-SHA256, keyed by the SHA-256 of
//! the bot token, over the sorted `key=value` lines of every field except `hash`. A payload
//! is accepted for [`MAX_AUTH_AGE_SECS`] after its `auth_date`.

use super::payload;
use crate::api::{
    error::{ok, ApiError, ApiResult},
    storage::ExternalAccount,
    AppState,
};
use axum::{
    extract::{rejection::JsonRejection, Extension},
    Json,
};
use hmac::{Hmac, Mac};
use secrecy::ExposeSecret;
use serde::{Deserialize, Deserializer};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{info, instrument, warn};

type HmacSha256 = Hmac<Sha256>;

pub const MAX_AUTH_AGE_SECS: i64 = 5 * 60;
const PROVIDER: &str = "telegram";

#[derive(Deserialize)]
#[serde(untagged)]
enum IdField {
    Text(String),
    Number(i64),
}

fn id_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match IdField::deserialize(deserializer)? {
        IdField::Text(text) => text,
        IdField::Number(number) => number.to_string(),
    })
}

#[derive(Deserialize, Debug, Clone)]
pub struct TelegramLogin {
    #[serde(deserialize_with = "id_text")]
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub photo_url: String,
    pub auth_date: i64,
    pub hash: String,
}

/// Sorted `key=value` lines over the signed fields. Empty optional fields are not signed.
pub fn data_check_string(login: &TelegramLogin) -> String {
    let mut fields = BTreeMap::new();
    fields.insert("auth_date", login.auth_date.to_string());
    fields.insert("id", login.id.clone());
    for (key, value) in [
        ("username", &login.username),
        ("first_name", &login.first_name),
        ("last_name", &login.last_name),
        ("photo_url", &login.photo_url),
    ] {
        if !value.is_empty() {
            fields.insert(key, value.clone());
        }
    }
    fields
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    text.as_bytes()
        .chunks(2)
        .map(|pair| {
            let high = char::from(pair[0]).to_digit(16)?;
            let low = char::from(pair[1]).to_digit(16)?;
            u8::try_from(high * 16 + low).ok()
        })
        .collect()
}

/// Constant-time check of `login.hash` against `bot_token`. An empty token never verifies.
pub fn verify_signature(bot_token: &str, login: &TelegramLogin) -> bool {
    if bot_token.is_empty() {
        return false;
    }
    let Some(provided) = decode_hex(login.hash.trim()) else {
        return false;
    };
    let key = Sha256::digest(bot_token.as_bytes());
    let Ok(mut mac) = HmacSha256::new_from_slice(&key) else {
        return false;
    };
    mac.update(data_check_string(login).as_bytes());
    mac.verify_slice(&provided).is_ok()
}

/// `POST /v1/auth/telegram`
#[instrument(skip(state, body))]
pub async fn login(
    Extension(state): Extension<Arc<AppState>>,
    body: Result<Json<TelegramLogin>, JsonRejection>,
) -> ApiResult {
    let login = payload(body)?;

    let bot_token = state
        .telegram_bot_token
        .as_ref()
        .map_or("", |token| token.expose_secret());
    if !verify_signature(bot_token, &login) {
        warn!(telegram_id = %login.id, "telegram signature rejected");
        return Err(ApiError::InvalidTelegramSignature);
    }
    if (state.clock)().timestamp() - login.auth_date > MAX_AUTH_AGE_SECS {
        return Err(ApiError::TelegramLoginExpired);
    }

    let linked = state
        .users
        .find_or_create_external(&ExternalAccount {
            provider: PROVIDER,
            provider_id: login.id.clone(),
            username_hint: login.username.clone(),
            avatar_url: login.photo_url.clone(),
        })
        .await?;
    if linked.created {
        info!(user_id = linked.user_id, "telegram account created");
    }

    let token = state
        .tokens
        .issue(linked.user_id, &linked.username, None)
        .map_err(|err| ApiError::Internal(format!("failed to issue token: {err}")))?;
    Ok(ok(json!({
        "user_id": linked.user_id,
        "username": linked.username,
        "token": token,
        "expires_in": state.tokens.default_ttl().as_secs(),
    })))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{data_check_string, HmacSha256, Mac, TelegramLogin};
    use sha2::{Digest, Sha256};
    use std::fmt::Write;

    /// Sign `login` the way the widget does, returning the hex digest.
    pub fn sign(bot_token: &str, login: &TelegramLogin) -> String {
        let key = Sha256::digest(bot_token.as_bytes());
        let mut mac = HmacSha256::new_from_slice(&key).expect("hmac accepts any key length");
        mac.update(data_check_string(login).as_bytes());
        mac.finalize()
            .into_bytes()
            .iter()
            .fold(String::new(), |mut hex, byte| {
                let _ = write!(hex, "{byte:02x}");
                hex
            })
    }
}
