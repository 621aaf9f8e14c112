//! Signalcli.
//!
//! An operator tool for the signalcache computation cache. It derives cache keys from request
//! payloads, inspects and purges stored artifacts, and probes rate limits, using the same
//! configuration file as the services embedding the cache.

#![warn(missing_debug_implementations, clippy::all)]

mod cli;
mod commands;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
