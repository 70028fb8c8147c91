//! Tracing initialization for binaries and tests embedding the store.

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::Config;

/// Installs a global `fmt` subscriber filtered by the configured
/// `RUST_LOG` directives.
///
/// # Errors
///
/// Fails if the filter does not parse or a global subscriber is already
/// installed.
pub fn init_tracing(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_new(&config.rust_log).context("Invalid RUST_LOG filter")?;

    let fmt_layer = fmt::layer().with_target(true).with_file(true).with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("Failed to install tracing subscriber")
}

/// Installs a test-writer subscriber; repeated calls are no-ops.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,eventide=debug")),
        )
        .with_test_writer()
        .try_init();
}
