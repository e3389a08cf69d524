//! Uniform JSON envelope for every response.
//!
//! Failures render as `{"code": <int>, "message": <string>}` with the HTTP status from
//! [`ApiError::status`]; successes as `{"code": 0, "message": "success", "data": ...}`.

use super::storage::{SignInError, StoreError};
use crate::guard::{Rejection, RegistrationError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid request payload: {0}")]
    InvalidPayload(String),
    #[error("{0}")]
    Validation(String),
    #[error("invalid or expired verification code")]
    InvalidEmailCode,
    #[error("captcha answer is incorrect or expired")]
    CaptchaMismatch,
    #[error("invalid or expired state")]
    InvalidState,
    #[error("already signed in today")]
    AlreadySignedIn,
    #[error("missing authorization header")]
    MissingAuthHeader,
    #[error("authorization header must be: Bearer <token>")]
    BadAuthHeader,
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("invalid username or password")]
    BadLogin,
    #[error("invalid telegram signature")]
    InvalidTelegramSignature,
    #[error("telegram login expired")]
    TelegramLoginExpired,
    #[error("user not found")]
    UserNotFound,
    #[error("username already exists")]
    UsernameExists,
    #[error("too many requests")]
    RateLimited,
    #[error("please wait before trying again")]
    Cooldown,
    #[error("temporarily banned, try again later")]
    Banned,
    #[error("daily registration limit reached")]
    DailyQuotaExceeded,
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidPayload(_)
            | Self::Validation(_)
            | Self::InvalidEmailCode
            | Self::CaptchaMismatch
            | Self::InvalidState
            | Self::AlreadySignedIn => StatusCode::BAD_REQUEST,
            Self::MissingAuthHeader
            | Self::BadAuthHeader
            | Self::InvalidToken
            | Self::BadLogin
            | Self::InvalidTelegramSignature
            | Self::TelegramLoginExpired => StatusCode::UNAUTHORIZED,
            Self::UserNotFound => StatusCode::NOT_FOUND,
            Self::UsernameExists => StatusCode::CONFLICT,
            Self::RateLimited | Self::Cooldown | Self::Banned | Self::DailyQuotaExceeded => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Self::NotConfigured(_) => StatusCode::NOT_IMPLEMENTED,
            Self::Store(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidPayload(_) => 40001,
            Self::Validation(_) | Self::InvalidEmailCode => 40002,
            Self::InvalidState => 40006,
            Self::AlreadySignedIn => 40030,
            Self::CaptchaMismatch => 40062,
            Self::MissingAuthHeader => 40101,
            Self::BadAuthHeader => 40102,
            Self::InvalidToken => 40105,
            Self::BadLogin => 40106,
            Self::InvalidTelegramSignature => 40108,
            Self::TelegramLoginExpired => 40109,
            Self::UserNotFound => 40410,
            Self::UsernameExists => 40901,
            Self::RateLimited => 42901,
            Self::Cooldown => 42910,
            Self::Banned => 42920,
            Self::DailyQuotaExceeded => 42921,
            Self::Internal(_) => 50000,
            Self::Store(_) => 50001,
            Self::NotConfigured(_) => 50101,
        }
    }
}

impl From<Rejection> for ApiError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::Banned => Self::Banned,
            Rejection::Cooldown => Self::Cooldown,
            Rejection::DailyQuotaExceeded => Self::DailyQuotaExceeded,
        }
    }
}

impl<E: Into<ApiError>> From<RegistrationError<E>> for ApiError {
    fn from(err: RegistrationError<E>) -> Self {
        match err {
            RegistrationError::Rejected(rejection) => rejection.into(),
            RegistrationError::Attempt(err) => err.into(),
        }
    }
}

impl From<SignInError> for ApiError {
    fn from(err: SignInError) -> Self {
        match err {
            SignInError::AlreadySignedIn => Self::AlreadySignedIn,
            SignInError::UserNotFound => Self::UserNotFound,
            SignInError::Store(err) => Self::Store(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Internal details stay in the logs.
        let message = if status.is_server_error() && !matches!(self, Self::NotConfigured(_)) {
            error!(error = %self, "request failed");
            "internal server error".to_string()
        } else {
            self.to_string()
        };
        let body = Json(json!({ "code": self.code(), "message": message }));
        (status, body).into_response()
    }
}

/// Success envelope.
pub fn ok<T: Serialize>(data: T) -> Json<serde_json::Value> {
    Json(json!({ "code": 0, "message": "success", "data": data }))
}

pub type ApiResult<T = Json<serde_json::Value>> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn render(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap_or_default();
        (status, serde_json::from_slice(&body).unwrap_or_default())
    }

    #[tokio::test]
    async fn client_errors_carry_their_message() {
        let (status, body) = render(ApiError::Cooldown).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["code"], 42910);
        assert_eq!(body["message"], "please wait before trying again");
    }

    #[tokio::test]
    async fn internal_errors_are_masked() {
        let (status, body) = render(ApiError::Internal("pool exhausted".to_string())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], 50000);
        assert_eq!(body["message"], "internal server error");
    }

    #[test]
    fn rejections_map_to_distinct_codes() {
        let codes: Vec<u32> = [
            Rejection::Banned,
            Rejection::Cooldown,
            Rejection::DailyQuotaExceeded,
        ]
        .into_iter()
        .map(|r| ApiError::from(r).code())
        .collect();
        assert_eq!(codes, vec![42920, 42910, 42921]);
    }

    #[test]
    fn success_envelope_shape() {
        let Json(body) = ok(json!({ "token": "t" }));
        assert_eq!(body["code"], 0);
        assert_eq!(body["message"], "success");
        assert_eq!(body["data"]["token"], "t");
    }
}
