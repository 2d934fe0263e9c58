//! Subscriber bootstrap for runtime binaries.

use crate::config::{Config, LogFormat};
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber for a resolved [`Config`].
///
/// The configured `log_level` seeds the filter, but explicit `RUST_LOG`
/// directives win when the variable is set. Event timestamps are omitted:
/// the log sink stamps every line on its own.
pub fn init_subscriber(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time();
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Resolve the configuration from the environment and install the
/// subscriber. A malformed environment falls back to the defaults so a
/// broken `LOG_FORMAT` cannot leave a binary without logs; the invocation
/// loop will still reject it when [`run`](crate::run) reads the
/// configuration for real.
pub fn init_default_subscriber() {
    let config = Config::from_env().unwrap_or_default();
    init_subscriber(&config);
}
