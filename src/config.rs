//! Service configuration.
//!
//! Loaded in one pass: an optional JSON file, serde defaults for anything it leaves out,
//! then `FORUMGUARD_*` environment overrides. Each field can be overridden on its own.
//! Command-line flags for port, DSN and redis URL are applied last by the CLI.

use crate::guard::RegistrationPolicy;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;
use url::Url;

pub const ENV_PREFIX: &str = "FORUMGUARD_";
/// Fallback-backed features bound each operation at 500 ms.
const MAX_FALLBACK_TIMEOUT_MS: u64 = 400;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: String, value: String },
    #[error("a JWT secret is required (auth.jwt_secret or FORUMGUARD_JWT_SECRET)")]
    MissingJwtSecret,
    #[error("invalid redis address: {0}")]
    RedisUrl(String),
}

fn secret<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SecretString, D::Error> {
    String::deserialize(deserializer).map(SecretString::from)
}

fn optional_secret<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<SecretString>, D::Error> {
    Option::<String>::deserialize(deserializer).map(|value| value.map(SecretString::from))
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "::".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub rate_limit_per_minute: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_minute: crate::guard::rate_limit::DEFAULT_LIMIT_PER_MINUTE,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    pub attempt_cooldown_secs: u64,
    pub max_per_ip_per_day: u32,
    pub failed_max_per_ip_per_hour: u32,
    pub temp_ban_minutes: u64,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            attempt_cooldown_secs: 10,
            max_per_ip_per_day: 5,
            failed_max_per_ip_per_hour: 20,
            temp_ban_minutes: 60,
        }
    }
}

impl RegistrationConfig {
    #[must_use]
    pub fn policy(&self) -> RegistrationPolicy {
        RegistrationPolicy {
            cooldown: Duration::from_secs(self.attempt_cooldown_secs),
            daily_max: self.max_per_ip_per_day,
            failures_per_hour: self.failed_max_per_ip_per_hour,
            ban_duration: Duration::from_secs(self.temp_ban_minutes.saturating_mul(60)),
        }
        .normalize()
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Full connection URL; wins over host/port/password/db when set.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    #[serde(deserialize_with = "optional_secret")]
    pub password: Option<SecretString>,
    pub db: u32,
    pub dial_timeout_ms: u64,
    pub op_timeout_ms: u64,
    /// Time a fallback-backed feature waits on redis before answering from its local map.
    /// Clamped below the per-feature operation deadline.
    pub fallback_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            db: 0,
            dial_timeout_ms: 3000,
            op_timeout_ms: 2000,
            fallback_timeout_ms: 250,
        }
    }
}

impl RedisConfig {
    /// Connection URL for the redis client.
    ///
    /// # Errors
    /// Returns an error if host or credentials cannot form a valid URL.
    pub fn connection_url(&self) -> Result<String, ConfigError> {
        if let Some(url) = self.url.as_deref().filter(|u| !u.is_empty()) {
            return Ok(url.to_string());
        }
        let mut url = Url::parse("redis://localhost")
            .map_err(|e| ConfigError::RedisUrl(e.to_string()))?;
        url.set_host(Some(&self.host))
            .map_err(|e| ConfigError::RedisUrl(format!("{}: {e}", self.host)))?;
        url.set_port(Some(self.port))
            .map_err(|()| ConfigError::RedisUrl("cannot set port".to_string()))?;
        if let Some(password) = &self.password {
            url.set_password(Some(password.expose_secret()))
                .map_err(|()| ConfigError::RedisUrl("cannot set password".to_string()))?;
        }
        url.set_path(&self.db.to_string());
        Ok(url.to_string())
    }

    #[must_use]
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    #[must_use]
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    #[must_use]
    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback_timeout_ms)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    #[serde(deserialize_with = "optional_secret")]
    pub dsn: Option<SecretString>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: None,
            max_connections: 20,
            min_connections: 5,
            max_lifetime_secs: 30 * 60,
            idle_timeout_secs: 10 * 60,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    #[serde(deserialize_with = "secret")]
    pub jwt_secret: SecretString,
    pub token_ttl_hours: u64,
    pub captcha_enabled: bool,
    pub captcha_ttl_secs: u64,
    pub email_code_length: usize,
    pub email_code_ttl_secs: u64,
    pub email_cooldown_secs: u64,
    pub oauth_state_ttl_secs: u64,
    /// Provider authorization endpoint; the state is appended as `state=`.
    pub oauth_authorize_url: Option<String>,
    /// Bot token that signs Telegram login widget payloads. Unset rejects every payload.
    #[serde(deserialize_with = "optional_secret")]
    pub telegram_bot_token: Option<SecretString>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: SecretString::default(),
            token_ttl_hours: 72,
            captcha_enabled: true,
            captcha_ttl_secs: 600,
            email_code_length: 6,
            email_code_ttl_secs: 600,
            email_cooldown_secs: 60,
            oauth_state_ttl_secs: 600,
            oauth_authorize_url: None,
            telegram_bot_token: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SigninConfig {
    pub reward_points: i64,
}

impl Default for SigninConfig {
    fn default() -> Self {
        Self { reward_points: 10 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    pub sweep_interval_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            shutdown_grace_secs: 5,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub registration: RegistrationConfig,
    pub cache: CacheConfig,
    pub redis: RedisConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub signin: SigninConfig,
    pub tasks: TasksConfig,
}

fn override_parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    target: &mut T,
) -> Result<(), ConfigError> {
    let var = format!("{ENV_PREFIX}{name}");
    if let Some(value) = lookup(&var) {
        *target = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { var, value })?;
    }
    Ok(())
}

fn override_string(lookup: &impl Fn(&str) -> Option<String>, name: &str, target: &mut String) {
    if let Some(value) = lookup(&format!("{ENV_PREFIX}{name}")) {
        *target = value;
    }
}

fn override_secret(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    target: &mut Option<SecretString>,
) {
    if let Some(value) = lookup(&format!("{ENV_PREFIX}{name}")) {
        *target = Some(SecretString::from(value));
    }
}

impl Config {
    /// Load from `path` (if any) and the process environment.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, an override does not parse,
    /// or no JWT secret is configured.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// Same as [`Config::load`] with a custom environment lookup.
    ///
    /// # Errors
    /// See [`Config::load`].
    pub fn load_with(
        path: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        override_string(lookup, "HOST", &mut self.server.host);
        override_parse(lookup, "RATE_LIMIT_PER_MINUTE", &mut self.limits.rate_limit_per_minute)?;

        let reg = &mut self.registration;
        override_parse(lookup, "REGISTER_COOLDOWN_SECS", &mut reg.attempt_cooldown_secs)?;
        override_parse(lookup, "REGISTER_MAX_PER_IP_PER_DAY", &mut reg.max_per_ip_per_day)?;
        override_parse(
            lookup,
            "REGISTER_FAILED_MAX_PER_IP_PER_HOUR",
            &mut reg.failed_max_per_ip_per_hour,
        )?;
        override_parse(lookup, "REGISTER_TEMP_BAN_MINUTES", &mut reg.temp_ban_minutes)?;

        override_parse(lookup, "CACHE_TTL_SECS", &mut self.cache.default_ttl_secs)?;

        override_string(lookup, "REDIS_HOST", &mut self.redis.host);
        override_parse(lookup, "REDIS_PORT", &mut self.redis.port)?;
        override_parse(lookup, "REDIS_DB", &mut self.redis.db)?;
        override_secret(lookup, "REDIS_PASSWORD", &mut self.redis.password);
        override_parse(lookup, "REDIS_FALLBACK_TIMEOUT_MS", &mut self.redis.fallback_timeout_ms)?;

        override_parse(lookup, "DB_MAX_CONNECTIONS", &mut self.database.max_connections)?;

        if let Some(value) = lookup(&format!("{ENV_PREFIX}JWT_SECRET")) {
            self.auth.jwt_secret = SecretString::from(value);
        }
        override_parse(lookup, "TOKEN_TTL_HOURS", &mut self.auth.token_ttl_hours)?;
        override_parse(lookup, "CAPTCHA_ENABLED", &mut self.auth.captcha_enabled)?;
        override_secret(lookup, "TELEGRAM_BOT_TOKEN", &mut self.auth.telegram_bot_token);
        override_parse(lookup, "SIGNIN_REWARD_POINTS", &mut self.signin.reward_points)?;
        override_parse(lookup, "SWEEP_INTERVAL_SECS", &mut self.tasks.sweep_interval_secs)?;
        Ok(())
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        if self.auth.jwt_secret.expose_secret().trim().is_empty() {
            return Err(ConfigError::MissingJwtSecret);
        }
        self.limits.rate_limit_per_minute = self.limits.rate_limit_per_minute.max(1);
        self.redis.fallback_timeout_ms = self
            .redis
            .fallback_timeout_ms
            .clamp(1, MAX_FALLBACK_TIMEOUT_MS);
        Ok(())
    }

    #[must_use]
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.auth.token_ttl_hours.saturating_mul(3600))
    }
}
