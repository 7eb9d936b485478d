//! # Logging Bootstrap
//!
//! Structured logging via tracing. Call [`init_logging`] once from a binary
//! or test; the filter comes from `RUST_LOG` and defaults to `info`.

use tracing_subscriber::{fmt, EnvFilter};

/// Initializes the global tracing subscriber. Safe to call more than once;
/// later calls are no-ops.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
