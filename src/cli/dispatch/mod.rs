//! Command-line argument dispatch.
//!
//! Loads the configuration (file, defaults, environment) and lays the command-line
//! overrides for port, DSN and redis URL on top.

use crate::cli::{
    actions::{server::Args, Action},
    commands::{ARG_CONFIG, ARG_DSN, ARG_PORT, ARG_REDIS_URL},
};
use crate::config::Config;
use anyhow::{Context, Result};
use secrecy::SecretString;
use std::path::PathBuf;

/// Apply command-line overrides to a loaded configuration.
///
/// # Errors
/// Returns an error if no database DSN is configured anywhere.
pub fn apply_overrides(mut config: Config, matches: &clap::ArgMatches) -> Result<Config> {
    if let Some(port) = matches.get_one::<u16>(ARG_PORT) {
        config.server.port = *port;
    }
    if let Some(dsn) = matches.get_one::<String>(ARG_DSN) {
        config.database.dsn = Some(SecretString::from(dsn.clone()));
    }
    if let Some(url) = matches.get_one::<String>(ARG_REDIS_URL) {
        config.redis.url = Some(url.clone());
    }
    if config.database.dsn.is_none() {
        anyhow::bail!("missing required argument: --dsn");
    }
    Ok(config)
}

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if the configuration cannot be loaded or is incomplete.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let path = matches.get_one::<String>(ARG_CONFIG).map(PathBuf::from);
    let config = Config::load(path.as_deref()).context("failed to load configuration")?;
    let config = apply_overrides(config, matches)?;
    Ok(Action::Server(Args { config }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn flags_override_the_config() -> Result<()> {
        let matches = crate::cli::commands::new().get_matches_from(vec![
            "forumguard",
            "--port",
            "9000",
            "--dsn",
            "postgres://localhost/forum",
            "--redis-url",
            "redis://cache:6379/3",
        ]);
        let config = apply_overrides(Config::default(), &matches)?;
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.redis.url.as_deref(), Some("redis://cache:6379/3"));
        assert_eq!(
            config.database.dsn.as_ref().map(|dsn| dsn.expose_secret().to_string()),
            Some("postgres://localhost/forum".to_string())
        );
        Ok(())
    }

    #[test]
    fn dsn_is_required() {
        temp_env::with_vars([("FORUMGUARD_DSN", None::<&str>)], || {
            let matches = crate::cli::commands::new().get_matches_from(vec!["forumguard"]);
            let result = apply_overrides(Config::default(), &matches);
            assert!(result.is_err());
            if let Err(err) = result {
                assert!(err.to_string().contains("missing required argument: --dsn"));
            }
        });
    }

    #[test]
    fn handler_builds_a_server_action() {
        temp_env::with_vars(
            [
                ("FORUMGUARD_DSN", Some("postgres://localhost/forum")),
                ("FORUMGUARD_JWT_SECRET", Some("dispatch-secret")),
                ("FORUMGUARD_CONFIG", None),
                ("FORUMGUARD_PORT", Some("8181")),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["forumguard"]);
                let result = handler(&matches);
                assert!(matches!(
                    result,
                    Ok(Action::Server(Args { ref config })) if config.server.port == 8181
                ));
            },
        );
    }

    #[test]
    fn handler_requires_a_jwt_secret() {
        temp_env::with_vars(
            [
                ("FORUMGUARD_DSN", Some("postgres://localhost/forum")),
                ("FORUMGUARD_JWT_SECRET", None),
                ("FORUMGUARD_CONFIG", None),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["forumguard"]);
                assert!(handler(&matches).is_err());
            },
        );
    }
}
