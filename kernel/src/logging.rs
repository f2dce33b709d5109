//! Logging setup
//!
//! Installs a `tracing` subscriber with an `fmt` layer. `RUST_LOG` takes
//! precedence over the level passed in.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber. Later calls are no-ops.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init();
}
