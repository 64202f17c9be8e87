//! Logging Module
//!
//! Installs a `tracing` subscriber writing formatted events to stderr.

use tracing_subscriber::EnvFilter;

/// Parse `filter`, falling back to `info` on a malformed directive
fn filter_or_default(filter: &str) -> EnvFilter {
    EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `filter` when set. Returns false if a
/// global subscriber was already installed, in which case nothing changes.
pub fn init_logging(filter: &str) -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter_or_default(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_thread_names(true)
        .with_target(false)
        .try_init()
        .is_ok()
}
