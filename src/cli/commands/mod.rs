pub mod logging;

use clap::{
    builder::styling::{AnsiColor, Effects, Styles},
    Arg, ColorChoice, Command,
};

pub const ARG_CONFIG: &str = "config";
pub const ARG_PORT: &str = "port";
pub const ARG_DSN: &str = "dsn";
pub const ARG_REDIS_URL: &str = "redis-url";

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("forumguard")
        .about("Abuse control, tokens and caching for forum backends")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new(ARG_CONFIG)
                .short('c')
                .long("config")
                .help("Path to a JSON configuration file")
                .env("FORUMGUARD_CONFIG"),
        )
        .arg(
            Arg::new(ARG_PORT)
                .short('p')
                .long("port")
                .help("Port to listen on (default: 8080)")
                .env("FORUMGUARD_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_DSN)
                .short('d')
                .long("dsn")
                .help("Database connection string")
                .env("FORUMGUARD_DSN"),
        )
        .arg(
            Arg::new(ARG_REDIS_URL)
                .long("redis-url")
                .help("Redis URL, overrides the redis host/port/password/db settings")
                .env("FORUMGUARD_REDIS_URL"),
        );

    logging::with_args(command)
}
