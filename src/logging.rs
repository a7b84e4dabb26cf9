//! Logging and tracing initialization.
//!
//! The log level is controlled by the `RUST_LOG` environment variable:
//!
//! ```bash
//! RUST_LOG=debug ./presto 8080
//! ```
//!
//! Unset, the level defaults to `info`.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the tracing subscriber. Call once, before starting the server.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Install the tracing subscriber at an explicit level, ignoring `RUST_LOG`
/// only when it is unset.
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
