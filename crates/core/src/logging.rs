//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Build the filter for `config`: `RUST_LOG` when allowed and set, else the
/// configured level, else `info`.
pub fn filter_for(config: &LoggingConfig) -> EnvFilter {
    if config.env_override {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return filter;
        }
    }
    EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global fmt subscriber. Returns `false` if one was already
/// installed, which makes repeated calls from tests harmless.
pub fn init(config: &LoggingConfig) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter_for(config))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .try_init()
        .is_ok()
}
