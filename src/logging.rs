//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingSection};

/// Filter directive: `RUST_LOG` wins, then `--verbose`, then `[logging].level`.
fn make_filter(logging: &LoggingSection, verbose: bool) -> EnvFilter {
    let fallback = if verbose { "debug" } else { logging.level.as_str() };
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init(logging: &LoggingSection, verbose: bool) {
    let filter = make_filter(logging, verbose);
    let result = match logging.format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .try_init(),
    };

    if result.is_ok() {
        tracing::debug!(level = %logging.level, format = ?logging.format, verbose, "tracing initialized");
    }
}
