use crate::{
    api::{
        error::{ok, ApiError, ApiResult},
        middleware::AuthUser,
        AppState,
    },
    cache::keys::Mutation,
};
use axum::extract::Extension;
use std::sync::Arc;
use tracing::info;

/// `POST /v1/signin`
pub async fn sign_in(
    Extension(state): Extension<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult {
    let today = (state.clock)().date_naive();
    let outcome = state
        .users
        .sign_in(user.claims.user_id, state.settings.signin_reward, today)
        .await?;

    // Points and streak are part of the cached public profile.
    state
        .cache
        .invalidate(&Mutation::User {
            user_id: user.claims.user_id,
            username: user.claims.username.clone(),
        })
        .await;

    info!(
        user_id = user.claims.user_id,
        streak = outcome.streak,
        "daily sign-in recorded"
    );
    Ok(ok(outcome))
}

/// `GET /v1/signin/status`
pub async fn status(
    Extension(state): Extension<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult {
    let today = (state.clock)().date_naive();
    let status = state
        .users
        .signin_status(user.claims.user_id, today)
        .await?
        .ok_or(ApiError::UserNotFound)?;
    Ok(ok(status))
}
