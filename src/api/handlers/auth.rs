//! Registration, login and the one-time secrets that guard them.

use super::{payload, valid_email, valid_password, valid_username};
use crate::{
    api::{
        error::{ok, ApiError, ApiResult},
        mail::VerificationMail,
        middleware::AuthUser,
        storage::{NewUser, StoreError},
        AppState,
    },
    identity::ClientIp,
    secret::generate_code,
};
use anyhow::anyhow;
use argon2::{password_hash::SaltString, Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::{
    extract::{rejection::JsonRejection, Extension, Query},
    Json,
};
use rand::rngs::OsRng;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use url::Url;

#[derive(Deserialize, Debug)]
pub struct CaptchaAnswer {
    pub captcha_id: String,
    pub answer: String,
}

#[derive(Deserialize, Debug)]
pub struct EmailCodeRequest {
    pub email: String,
    pub captcha_id: Option<String>,
    pub captcha_answer: Option<String>,
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub confirm_password: String,
    pub email: String,
    pub code: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize, Debug)]
pub struct CallbackParams {
    pub state: Option<String>,
    pub code: Option<String>,
}

fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| anyhow!("failed to hash password"))
}

fn verify_password(password: &str, stored_hash: &str) -> bool {
    PasswordHash::new(stored_hash).is_ok_and(|parsed| {
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
}

fn issue_token(state: &AppState, user_id: u64, username: &str) -> ApiResult {
    let token = state
        .tokens
        .issue(user_id, username, None)
        .map_err(|err| ApiError::Internal(format!("failed to issue token: {err}")))?;
    Ok(ok(json!({
        "user_id": user_id,
        "username": username,
        "token": token,
        "expires_in": state.tokens.default_ttl().as_secs(),
    })))
}

/// `GET /v1/auth/captcha`
pub async fn captcha(Extension(state): Extension<Arc<AppState>>) -> ApiResult {
    let challenge = state
        .captchas
        .issue()
        .await
        .map_err(|err| ApiError::Internal(format!("failed to store captcha: {err}")))?;
    Ok(ok(challenge))
}

/// `POST /v1/auth/captcha/verify`: checks the answer but leaves the challenge usable.
pub async fn captcha_verify(
    Extension(state): Extension<Arc<AppState>>,
    body: Result<Json<CaptchaAnswer>, JsonRejection>,
) -> ApiResult {
    let body = payload(body)?;
    if state.captchas.check(&body.captcha_id, &body.answer).await {
        Ok(ok(json!({ "valid": true })))
    } else {
        Err(ApiError::CaptchaMismatch)
    }
}

/// `POST /v1/auth/email-code`
#[instrument(skip(state, body))]
pub async fn email_code(
    Extension(state): Extension<Arc<AppState>>,
    body: Result<Json<EmailCodeRequest>, JsonRejection>,
) -> ApiResult {
    let body = payload(body)?;
    let email = body.email.trim().to_lowercase();
    if !valid_email(&email) {
        return Err(ApiError::Validation("invalid email address".to_string()));
    }

    if state.settings.captcha_enabled {
        let (Some(id), Some(answer)) = (&body.captcha_id, &body.captcha_answer) else {
            return Err(ApiError::CaptchaMismatch);
        };
        if !state.captchas.verify(id, answer).await {
            return Err(ApiError::CaptchaMismatch);
        }
    }

    if !state
        .email_codes
        .try_acquire_cooldown(&email, state.settings.email_cooldown)
        .await
    {
        return Err(ApiError::Cooldown);
    }

    let code = generate_code(state.settings.email_code_length);
    let ttl = state.settings.email_code_ttl;
    state
        .mailer
        .send_code(&VerificationMail {
            to_email: email.clone(),
            code: code.clone(),
            valid_minutes: ttl.as_secs() / 60,
        })
        .await
        .map_err(|err| ApiError::Internal(format!("failed to send verification code: {err}")))?;
    state
        .email_codes
        .save(&email, &code, ttl)
        .await
        .map_err(|err| ApiError::Internal(format!("failed to store verification code: {err}")))?;

    debug!("verification code issued");
    Ok(ok(json!({ "expires_in": ttl.as_secs() })))
}

fn validate_registration(body: &RegisterRequest) -> Result<(), ApiError> {
    if !valid_username(&body.username) {
        return Err(ApiError::Validation(
            "username must be 2-15 letters, digits or '-'".to_string(),
        ));
    }
    if !valid_password(&body.password) {
        return Err(ApiError::Validation(
            "password must be 6-18 characters of letters, digits, '-', '_' or '.'".to_string(),
        ));
    }
    if body.password != body.confirm_password {
        return Err(ApiError::Validation("passwords do not match".to_string()));
    }
    if body.email.trim().is_empty() || body.code.trim().is_empty() {
        return Err(ApiError::Validation(
            "email and verification code are required".to_string(),
        ));
    }
    if !valid_email(body.email.trim()) {
        return Err(ApiError::Validation("invalid email address".to_string()));
    }
    Ok(())
}

/// `POST /v1/auth/register`
///
/// Validation, the duplicate check and the code check all happen before the abuse gates,
/// so none of them touch the per-address counters.
#[instrument(skip(state, client, body), fields(ip = %client.key()))]
pub async fn register(
    Extension(state): Extension<Arc<AppState>>,
    client: ClientIp,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiResult {
    let body = payload(body)?;
    validate_registration(&body)?;

    let email = body.email.trim().to_lowercase();
    let username = body.username;

    if state.users.username_exists(&username).await? {
        return Err(ApiError::UsernameExists);
    }
    if !state.email_codes.verify_and_consume(&email, &body.code).await {
        return Err(ApiError::InvalidEmailCode);
    }

    let users = state.users.clone();
    let password = body.password;
    let new_username = username.clone();
    let user_id = state
        .guard
        .guard_registration(&client.key(), || async move {
            let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
                .await
                .map_err(|err| ApiError::Internal(err.to_string()))?
                .map_err(|err| ApiError::Internal(err.to_string()))?;
            users
                .create_user(&NewUser {
                    username: new_username,
                    email,
                    password_hash,
                })
                .await
                .map_err(|err| match err {
                    StoreError::Conflict => ApiError::UsernameExists,
                    other => ApiError::Store(other),
                })
        })
        .await?;

    info!(user_id, "user registered");
    issue_token(&state, user_id, &username)
}

/// `POST /v1/auth/login`
#[instrument(skip(state, body))]
pub async fn login(
    Extension(state): Extension<Arc<AppState>>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> ApiResult {
    let body = payload(body)?;
    let Some(credentials) = state.users.find_credentials(body.username.trim()).await? else {
        return Err(ApiError::BadLogin);
    };

    let password = body.password;
    let stored_hash = credentials.password_hash;
    let matches = tokio::task::spawn_blocking(move || verify_password(&password, &stored_hash))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    if !matches {
        warn!(user_id = credentials.user_id, "password mismatch");
        return Err(ApiError::BadLogin);
    }

    issue_token(&state, credentials.user_id, &credentials.username)
}

/// `POST /v1/auth/logout`: the token stays rejected until it would have expired anyway.
pub async fn logout(
    Extension(state): Extension<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult {
    state
        .revocations
        .revoke(&user.token, user.claims.exp)
        .await
        .map_err(|err| ApiError::Internal(format!("failed to revoke token: {err}")))?;
    info!(user_id = user.claims.user_id, "user logged out");
    Ok(ok(serde_json::Value::Null))
}

/// `GET /v1/auth/me`
pub async fn me(
    Extension(state): Extension<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult {
    let account = state
        .users
        .account(user.claims.user_id)
        .await?
        .ok_or(ApiError::UserNotFound)?;
    Ok(ok(account))
}

/// `GET /v1/auth/oauth/state`
pub async fn oauth_state(Extension(state): Extension<Arc<AppState>>) -> ApiResult {
    let issued = state
        .oauth_states
        .issue()
        .await
        .map_err(|err| ApiError::Internal(format!("failed to store oauth state: {err}")))?;

    let authorize_url = match &state.settings.oauth_authorize_url {
        Some(base) => {
            let mut url = Url::parse(base)
                .map_err(|err| ApiError::Internal(format!("invalid authorize url: {err}")))?;
            url.query_pairs_mut().append_pair("state", &issued);
            Some(url.to_string())
        }
        None => None,
    };

    Ok(ok(json!({ "state": issued, "authorize_url": authorize_url })))
}

/// `GET /v1/auth/oauth/callback`: the state is spent even though no provider is wired up.
pub async fn oauth_callback(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> ApiResult {
    let Some(issued) = params.state.as_deref() else {
        return Err(ApiError::InvalidState);
    };
    if !state.oauth_states.consume(issued).await {
        return Err(ApiError::InvalidState);
    }
    debug!(has_code = params.code.is_some(), "oauth state accepted");
    Err(ApiError::NotConfigured("oauth provider"))
}
