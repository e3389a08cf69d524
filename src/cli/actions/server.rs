use crate::{
    api::{self, mail::LogMailer, storage::PgUserStore, AppState, Stores},
    cli::telemetry,
    config::Config,
    kv::{FallbackStore, KvStore, MemoryStore, RedisStore},
    tasks::{spawn_sweeper, Supervisor},
};
use anyhow::{Context, Result};
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};

#[derive(Debug)]
pub struct Args {
    pub config: Config,
}

/// Wrap `primary` once per feature that must survive a backend outage. Each primary call
/// gets `primary_deadline` before the feature's local map answers instead.
///
/// Returns the stores plus the process-local maps the sweeper has to purge.
#[must_use]
pub fn fallback_stores(
    primary: Arc<dyn KvStore>,
    primary_deadline: Duration,
) -> (Stores, Vec<Arc<MemoryStore>>) {
    let wrap = |name: &'static str| {
        Arc::new(
            FallbackStore::new(name, Arc::clone(&primary)).with_primary_deadline(primary_deadline),
        )
    };
    let email_codes = wrap("email-codes");
    let captchas = wrap("captcha");
    let oauth_states = wrap("oauth-state");
    let revocations = wrap("revocation");

    let locals = vec![
        email_codes.local(),
        captchas.local(),
        oauth_states.local(),
        revocations.local(),
    ];
    let stores = Stores {
        shared: primary,
        email_codes,
        captchas,
        oauth_states,
        revocations,
    };
    (stores, locals)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("ctrl_c signal received"),
        () = terminate => info!("terminate signal received"),
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if the configuration is unusable, the listener cannot bind or the
/// server fails.
pub async fn execute(args: Args) -> Result<()> {
    let config = args.config;

    let redis_url = config.redis.connection_url()?;
    let redis = Arc::new(
        RedisStore::new(
            &redis_url,
            config.redis.dial_timeout(),
            config.redis.op_timeout(),
        )
        .context("Invalid redis URL")?,
    );
    if let Err(err) = redis.connect().await {
        warn!(
            error = %err,
            "redis unavailable at startup, serving from local fallbacks until it answers"
        );
    }
    let (stores, locals) = fallback_stores(redis, config.redis.fallback_timeout());

    let dsn = config
        .database
        .dsn
        .as_ref()
        .context("missing required argument: --dsn")?;
    let pool = api::connect_pool(dsn, &config.database)?;

    let state = Arc::new(AppState::new(
        &config,
        stores,
        Arc::new(PgUserStore::new(pool.clone())),
        Arc::new(LogMailer),
    ));

    let mut supervisor = Supervisor::new();
    spawn_sweeper(
        &mut supervisor,
        locals,
        Duration::from_secs(config.tasks.sweep_interval_secs),
    );

    let listener = TcpListener::bind((config.server.host.as_str(), config.server.port))
        .await
        .with_context(|| {
            format!(
                "Failed to bind {}:{}",
                config.server.host, config.server.port
            )
        })?;

    let result = api::serve(listener, state, shutdown_signal()).await;

    supervisor
        .shutdown(Duration::from_secs(config.tasks.shutdown_grace_secs))
        .await;
    pool.close().await;
    telemetry::shutdown_tracer();

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{
        testing::{SlowStore, UnavailableStore},
        KvError, DEFAULT_PRIMARY_DEADLINE,
    };

    #[tokio::test]
    async fn outage_is_served_from_local_maps() -> Result<(), KvError> {
        let (stores, locals) =
            fallback_stores(Arc::new(UnavailableStore), DEFAULT_PRIMARY_DEADLINE);
        assert_eq!(locals.len(), 4);

        stores
            .email_codes
            .set("verify:email:a@example.com", b"482913", None)
            .await?;
        assert_eq!(
            stores
                .email_codes
                .get_and_delete("verify:email:a@example.com")
                .await?,
            Some(b"482913".to_vec())
        );
        assert!(stores.shared.get("anything").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn features_do_not_share_local_maps() -> Result<(), KvError> {
        let (stores, locals) =
            fallback_stores(Arc::new(UnavailableStore), DEFAULT_PRIMARY_DEADLINE);
        stores.captchas.set("captcha:x", b"7", None).await?;
        assert!(!stores.revocations.exists("captcha:x").await?);
        assert_eq!(locals.iter().map(|l| l.len()).sum::<usize>(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn configured_deadline_reaches_every_feature() -> Result<(), KvError> {
        let slow = Arc::new(SlowStore::new(Duration::from_millis(300)));
        let (stores, locals) = fallback_stores(slow, Duration::from_millis(100));
        stores.revocations.set("jwt:blacklist:x", b"1", None).await?;
        stores.oauth_states.set("oauth:state:x", b"1", None).await?;
        assert_eq!(locals.iter().map(|l| l.len()).sum::<usize>(), 2);
        Ok(())
    }
}
