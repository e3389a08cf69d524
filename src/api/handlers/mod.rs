pub mod auth;
pub mod health;
pub mod signin;
pub mod telegram;
pub mod users;

// common functions for the handlers
use super::error::ApiError;
use axum::{extract::rejection::JsonRejection, Json};
use regex::Regex;

pub fn valid_email(email: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|re| re.is_match(email))
}

/// 2 to 15 characters: Han, ASCII letters, digits and `-`.
pub fn valid_username(username: &str) -> bool {
    Regex::new(r"^[\p{Han}A-Za-z0-9-]{2,15}$").is_ok_and(|re| re.is_match(username))
}

/// 6 to 18 characters from `[A-Za-z0-9-_.]`.
pub fn valid_password(password: &str) -> bool {
    Regex::new(r"^[A-Za-z0-9_.\-]{6,18}$").is_ok_and(|re| re.is_match(password))
}

/// Unwrap a JSON body, turning any rejection into the uniform envelope.
pub fn payload<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::InvalidPayload(rejection.body_text()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usernames() {
        assert!(valid_username("alice"));
        assert!(valid_username("张三"));
        assert!(valid_username("dev-01"));
        assert!(!valid_username("a"));
        assert!(!valid_username("this-name-is-too-long"));
        assert!(!valid_username("bad name"));
        assert!(!valid_username("émile"));
    }

    #[test]
    fn passwords() {
        assert!(valid_password("secret1"));
        assert!(valid_password("a.b_c-d"));
        assert!(!valid_password("short"));
        assert!(!valid_password("nineteen-characters"));
        assert!(!valid_password("no spaces"));
    }

    #[test]
    fn emails() {
        assert!(valid_email("user@example.com"));
        assert!(!valid_email("user@"));
        assert!(!valid_email("user example.com"));
    }
}
