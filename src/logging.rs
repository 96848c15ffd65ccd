//! Logging bootstrap for the binaries.
//!
//! Library code only emits `tracing` events; binaries call `init_logging`
//! once. Output always goes to stderr because the extractor's stdout carries
//! its JSON report.

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "LAZYPLUG_LOG";
const DEFAULT_DIRECTIVE: &str = "warn";

/// Install a stderr subscriber filtered by `LAZYPLUG_LOG`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
