//! Diagnostic tracing
//!
//! Progress meant for the user goes to stdout/stderr directly. This module
//! only wires up `tracing` output for debugging, controlled by `GIT_SPLIT_LOG`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_ENV_VAR: &str = "GIT_SPLIT_LOG";

/// Initialize the tracing subscriber.
///
/// Reads `GIT_SPLIT_LOG` (same syntax as `RUST_LOG`). Defaults to `warn`.
/// Output: stderr, compact format.
///
/// ```bash
/// GIT_SPLIT_LOG=git_split=debug git-split split
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("warn"));

    // A second init (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
