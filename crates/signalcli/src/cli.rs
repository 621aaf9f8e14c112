//! Exposes the command line application.
use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use signalcache_service::caching::ComputationType;
use signalcache_service::config::Config;
use signalcache_service::metrics;

use crate::commands;
use crate::logging;

/// Inspects and maintains the signalcache computation cache.
///
/// All commands operate on the store configured in the configuration file. Without one, a
/// process-local memory store is used, which is only useful for `key`.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about)]
pub struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// The severity level of logging output, overriding the configuration.
    ///
    /// Possible values:
    /// off, error, warn, info, debug, trace
    #[arg(long, global = true)]
    pub log_level: Option<LevelFilter>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Prints the canonical form of a request payload and the cache key derived from it.
    Key(KeyArgs),
    /// Prints the artifact stored under a cache key, along with its current freshness.
    Inspect {
        /// The cache key, as printed by `key`.
        key: String,
    },
    /// Deletes the artifact stored under a cache key.
    Purge {
        /// The cache key, as printed by `key`.
        key: String,
    },
    /// Counts one request against the rate limits and prints the decision.
    RateLimit(RateLimitArgs),
}

#[derive(Debug, Args)]
pub struct KeyArgs {
    /// The computation type: oracle, pulse or reasoning.
    pub computation: ComputationType,

    /// The entity the computation is about, e.g. a ticker symbol.
    pub reference: String,

    /// The payload schema version.
    #[arg(long, default_value_t = 1)]
    pub version: u32,

    /// A JSON file holding the request context, or `-` to read it from stdin.
    ///
    /// Defaults to an empty object.
    #[arg(long, value_name = "FILE")]
    pub payload: Option<PathBuf>,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = true)]
pub struct RateLimitArgs {
    /// The IP address of the caller.
    #[arg(long)]
    pub ip: Option<IpAddr>,

    /// The id of an authenticated caller.
    #[arg(long)]
    pub user: Option<String>,
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config.as_deref()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    logging::init_logging(&config, cli.log_level);
    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd,
            config.metrics.custom_tags.clone(),
        )
        .context("failed to configure statsd")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    runtime.block_on(async {
        match cli.command {
            Command::Key(args) => commands::key(args).await,
            Command::Inspect { key } => commands::inspect(&config, &key).await,
            Command::Purge { key } => commands::purge(&config, &key).await,
            Command::RateLimit(args) => commands::rate_limit(&config, args).await,
        }
    })
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_key_args() {
        let cli = Cli::try_parse_from(["signalcli", "key", "pulse", "SOL", "--version", "2"]).unwrap();
        let Command::Key(args) = cli.command else {
            panic!("expected the key command");
        };
        assert_eq!(args.computation, ComputationType::Pulse);
        assert_eq!(args.reference, "SOL");
        assert_eq!(args.version, 2);
        assert_eq!(args.payload, None);

        assert!(Cli::try_parse_from(["signalcli", "key", "weather", "SOL"]).is_err());
    }

    #[test]
    fn test_rate_limit_needs_identity() {
        assert!(Cli::try_parse_from(["signalcli", "rate-limit"]).is_err());

        let cli = Cli::try_parse_from(["signalcli", "rate-limit", "--ip", "203.0.113.7"]).unwrap();
        let Command::RateLimit(args) = cli.command else {
            panic!("expected the rate-limit command");
        };
        assert_eq!(args.ip, Some(IpAddr::from([203, 0, 113, 7])));
        assert_eq!(args.user, None);
    }
}
