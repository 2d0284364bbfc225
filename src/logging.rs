//! Structured logging setup for the CLI binary.

use tracing_subscriber::EnvFilter;

/// Install a `tracing` subscriber reading level filters from `RUST_LOG`,
/// defaulting to `info` when unset. Safe to call more than once; later
/// calls are ignored.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
