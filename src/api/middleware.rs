use super::{error::ApiError, AppState};
use crate::{guard::rate_limit::RateLimitDecision, identity::ClientIp, token::Claims};
use axum::{
    extract::{Extension, Request},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::debug;

/// Verified caller, inserted by [`require_auth`].
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub claims: Claims,
    /// The raw bearer token, needed to revoke it on logout.
    pub token: String,
}

/// Per-minute request budget per client address.
pub async fn rate_limit(
    Extension(state): Extension<Arc<AppState>>,
    client: ClientIp,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    match state.limiter.check_ip(&client.key()).await {
        RateLimitDecision::Allowed => Ok(next.run(request).await),
        RateLimitDecision::Limited => Err(ApiError::RateLimited),
    }
}

fn bearer_token(request: &Request) -> Result<String, ApiError> {
    let value = request
        .headers()
        .get(AUTHORIZATION)
        .ok_or(ApiError::MissingAuthHeader)?
        .to_str()
        .map_err(|_| ApiError::BadAuthHeader)?;
    let (scheme, token) = value.split_once(' ').ok_or(ApiError::BadAuthHeader)?;
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(ApiError::BadAuthHeader);
    }
    Ok(token.to_string())
}

/// Bearer authentication. Malformed, expired and revoked tokens all answer the same way.
pub async fn require_auth(
    Extension(state): Extension<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(&request)?;
    let claims = state.tokens.verify(&token).map_err(|err| {
        debug!(error = %err, "token rejected");
        ApiError::InvalidToken
    })?;
    if state.revocations.is_revoked(&token).await {
        debug!(user_id = claims.user_id, "revoked token presented");
        return Err(ApiError::InvalidToken);
    }
    request.extensions_mut().insert(AuthUser { claims, token });
    Ok(next.run(request).await)
}
