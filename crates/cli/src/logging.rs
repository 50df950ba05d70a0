//! Logging setup

use crate::{Error, Result};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the tracing subscriber; `RUST_LOG` takes precedence over `default_level`
pub fn setup_logging(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| Error::Config(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}
