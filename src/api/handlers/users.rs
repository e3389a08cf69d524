use crate::{
    api::{
        error::{ok, ApiError, ApiResult},
        AppState,
    },
    cache::keys,
};
use axum::extract::{rejection::PathRejection, Extension, Path};
use std::sync::Arc;

/// `GET /v1/users/{id}`, served from `cache:user:{id}:public` when present.
pub async fn by_id(
    Extension(state): Extension<Arc<AppState>>,
    id: Result<Path<u64>, PathRejection>,
) -> ApiResult {
    let Path(id) = id.map_err(|rejection| ApiError::InvalidPayload(rejection.body_text()))?;
    let key = keys::user_public(id);
    let profile = state
        .cache
        .read_through(Some(&key), || async {
            state
                .users
                .profile_by_id(id)
                .await?
                .ok_or(ApiError::UserNotFound)
        })
        .await?;
    Ok(ok(profile))
}

/// `GET /v1/users/by-name/{username}`
pub async fn by_username(
    Extension(state): Extension<Arc<AppState>>,
    Path(username): Path<String>,
) -> ApiResult {
    let key = keys::user_public_by_name(&username);
    let profile = state
        .cache
        .read_through(Some(&key), || async {
            state
                .users
                .profile_by_username(&username)
                .await?
                .ok_or(ApiError::UserNotFound)
        })
        .await?;
    Ok(ok(profile))
}
