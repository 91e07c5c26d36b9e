//! Structured logging setup.
//!
//! The engine and bus only emit `tracing` events; installing a subscriber is
//! left to the embedding application. [`init_tracing`] is a convenience for
//! binaries and tests.

use tracing_subscriber::EnvFilter;

/// Directive applied when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_DIRECTIVE: &str = "prometheus_taskbus=info";

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to
/// [`DEFAULT_DIRECTIVE`]. Does nothing if a global subscriber already exists.
pub fn init_tracing() {
    init_tracing_with(DEFAULT_DIRECTIVE);
}

/// Like [`init_tracing`] with a caller-chosen fallback directive.
pub fn init_tracing_with(fallback: &str) {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}
