//! Helpers for testing the computation cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Prefer fixed timestamps from [`timestamp`] over `Utc::now()` where a test checks ages or
//!    window boundaries, so that it does not depend on when it runs.

use chrono::{DateTime, Utc};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `signalcache_service` crate and
///    mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("signalcache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Parses an RFC 3339 timestamp.
///
/// # Panics
///
/// Panics if `rfc3339` is not a valid timestamp.
pub fn timestamp(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .unwrap_or_else(|err| panic!("invalid timestamp `{rfc3339}`: {err}"))
        .to_utc()
}
