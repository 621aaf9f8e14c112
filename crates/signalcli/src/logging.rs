use std::env;

use signalcache_service::config::{Config, LogFormat};
use signalcache_service::logging::init_json_logging;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

fn get_rust_log(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "",
        LevelFilter::ERROR => "ERROR",
        LevelFilter::WARN => "WARN,redis=ERROR",
        LevelFilter::INFO => "INFO,redis=WARN",
        LevelFilter::DEBUG => {
            "INFO,\
             redis=WARN,\
             signalcache_service=DEBUG,\
             signalcli=DEBUG"
        }
        LevelFilter::TRACE => {
            "INFO,\
             redis=WARN,\
             signalcache_service=TRACE,\
             signalcli=TRACE"
        }
    }
}

/// Initializes logging for signalcli.
///
/// This considers the `RUST_LOG` environment variable and defaults it to the level specified in the
/// configuration, unless `level` overrides it.
pub fn init_logging(config: &Config, level: Option<LevelFilter>) {
    let level = level.unwrap_or(config.logging.level);
    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| get_rust_log(level).to_string());

    let fmt_layer = {
        // Command output goes to stdout, so logs must not.
        let layer = tracing_subscriber::fmt::layer()
            .with_timer(UtcTime::rfc_3339())
            .with_target(true)
            .with_writer(std::io::stderr);

        match (config.logging.format, console::user_attended_stderr()) {
            (LogFormat::Auto, true) | (LogFormat::Pretty, _) => layer.pretty().boxed(),
            (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
                layer.compact().with_ansi(false).boxed()
            }
            (LogFormat::Json, _) => {
                init_json_logging(&rust_log, std::io::stderr);
                return;
            }
        }
    }
    .with_filter(EnvFilter::new(&rust_log));

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sentry::integrations::tracing::layer())
        .init();
}

/// Logs an error to the configured logger or `stderr` if not yet configured.
pub fn ensure_log_error(error: &anyhow::Error) {
    if tracing::Level::ERROR <= tracing::level_filters::STATIC_MAX_LEVEL
        && tracing::Level::ERROR <= LevelFilter::current()
    {
        tracing::error!("{:?}", error);
    } else {
        eprintln!("{error:?}");
    }
}
