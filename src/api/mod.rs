use crate::{
    cache::ResponseCache,
    config::{Config, DatabaseConfig},
    guard::{
        rate_limit::{RateLimiter, WindowRateLimiter},
        system_clock, AbuseGuard, Clock,
    },
    kv::KvStore,
    revocation::RevocationRegistry,
    secret::{CaptchaStore, SecretStore, StateStore},
    token::TokenService,
};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    middleware as axum_middleware,
    routing::{get, post},
    Extension, Router,
};
use secrecy::{ExposeSecret, SecretString};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{info, info_span, Span};
use ulid::Ulid;

pub mod error;
pub mod handlers;
pub mod mail;
pub mod middleware;
pub mod storage;


use handlers::{auth, health, signin, telegram, users};
use mail::Mailer;
use storage::UserStore;

/// Key-value backends, one per feature so each can carry its own fallback.
#[derive(Clone)]
pub struct Stores {
    /// Counters, bans and cache. Failures here fail open or miss.
    pub shared: Arc<dyn KvStore>,
    pub email_codes: Arc<dyn KvStore>,
    pub captchas: Arc<dyn KvStore>,
    pub oauth_states: Arc<dyn KvStore>,
    pub revocations: Arc<dyn KvStore>,
}

impl Stores {
    /// Every feature on the same backend.
    #[must_use]
    pub fn unified(kv: Arc<dyn KvStore>) -> Self {
        Self {
            shared: kv.clone(),
            email_codes: kv.clone(),
            captchas: kv.clone(),
            oauth_states: kv.clone(),
            revocations: kv,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub captcha_enabled: bool,
    pub email_code_length: usize,
    pub email_code_ttl: Duration,
    pub email_cooldown: Duration,
    pub signin_reward: i64,
    pub oauth_authorize_url: Option<String>,
}

pub struct AppState {
    pub settings: AuthSettings,
    pub guard: AbuseGuard,
    pub limiter: Arc<dyn RateLimiter>,
    pub tokens: TokenService,
    pub revocations: RevocationRegistry,
    pub email_codes: SecretStore,
    pub captchas: CaptchaStore,
    pub oauth_states: StateStore,
    pub cache: ResponseCache,
    pub users: Arc<dyn UserStore>,
    pub mailer: Arc<dyn Mailer>,
    pub kv: Arc<dyn KvStore>,
    pub clock: Clock,
    pub telegram_bot_token: Option<SecretString>,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: &Config,
        stores: Stores,
        users: Arc<dyn UserStore>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        let auth = &config.auth;
        let secret = SecretString::from(auth.jwt_secret.expose_secret().to_string());
        Self {
            settings: AuthSettings {
                captcha_enabled: auth.captcha_enabled,
                email_code_length: auth.email_code_length,
                email_code_ttl: Duration::from_secs(auth.email_code_ttl_secs),
                email_cooldown: Duration::from_secs(auth.email_cooldown_secs),
                signin_reward: config.signin.reward_points,
                oauth_authorize_url: auth.oauth_authorize_url.clone(),
            },
            guard: AbuseGuard::new(stores.shared.clone(), config.registration.policy()),
            limiter: Arc::new(WindowRateLimiter::new(
                stores.shared.clone(),
                config.limits.rate_limit_per_minute,
            )),
            tokens: TokenService::new(secret).with_default_ttl(config.token_ttl()),
            revocations: RevocationRegistry::new(stores.revocations),
            email_codes: SecretStore::email_codes(stores.email_codes),
            captchas: CaptchaStore::new(stores.captchas)
                .with_ttl(Duration::from_secs(auth.captcha_ttl_secs)),
            oauth_states: StateStore::new(stores.oauth_states)
                .with_ttl(Duration::from_secs(auth.oauth_state_ttl_secs)),
            cache: ResponseCache::new(stores.shared.clone())
                .with_default_ttl(Duration::from_secs(config.cache.default_ttl_secs)),
            users,
            mailer,
            kv: stores.shared,
            clock: system_clock(),
            telegram_bot_token: auth
                .telegram_bot_token
                .as_ref()
                .map(|token| SecretString::from(token.expose_secret().to_string())),
        }
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Replace the wall clock used for day boundaries (sign-in, quotas, failure windows).
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.guard = self.guard.with_clock(clock.clone());
        self.clock = clock;
        self
    }
}

/// Routes without the request-id and tracing stack.
pub fn router(state: Arc<AppState>) -> Router {
    let authenticated = Router::new()
        .route("/v1/auth/logout", post(auth::logout))
        .route("/v1/auth/me", get(auth::me))
        .route("/v1/signin", post(signin::sign_in))
        .route("/v1/signin/status", get(signin::status))
        .route_layer(axum_middleware::from_fn(middleware::require_auth));

    Router::new()
        .route("/health", get(health::health))
        .route("/v1/auth/captcha", get(auth::captcha))
        .route("/v1/auth/captcha/verify", post(auth::captcha_verify))
        .route("/v1/auth/email-code", post(auth::email_code))
        .route("/v1/auth/register", post(auth::register))
        .route("/v1/auth/login", post(auth::login))
        .route("/v1/auth/telegram", post(telegram::login))
        .route("/v1/auth/oauth/state", get(auth::oauth_state))
        .route("/v1/auth/oauth/callback", get(auth::oauth_callback))
        .route("/v1/users/{id}", get(users::by_id))
        .route("/v1/users/by-name/{username}", get(users::by_username))
        .merge(authenticated)
        .layer(axum_middleware::from_fn(middleware::rate_limit))
        .layer(Extension(state))
}

pub fn app(state: Arc<AppState>) -> Router {
    router(state).layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static("x-request-id"),
                |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                "x-request-id",
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span)),
    )
}

/// Serve until `shutdown` resolves, then drain in-flight requests.
///
/// # Errors
/// Returns an error if the listener fails.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!("Listening on {}", addr);

    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        info!("Gracefully shutdown");
    })
    .await
    .context("HTTP server failed")
}

/// Lazy pool: startup does not wait for the database.
///
/// # Errors
/// Returns an error if the DSN cannot be parsed.
pub fn connect_pool(dsn: &SecretString, config: &DatabaseConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections.max(1))
        .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .acquire_timeout(Duration::from_secs(3))
        .test_before_acquire(true)
        .connect_lazy(dsn.expose_secret())
        .context("Invalid database DSN")
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
