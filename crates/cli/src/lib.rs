//! Operator tool for the bulk transport
//!
//! Configuration, logging and command implementations behind the `bulkctl`
//! binary.

pub mod commands;
pub mod config;
pub mod error;
pub mod logging;

pub use config::CliConfig;
pub use error::{Error, Result};
pub use logging::setup_logging;
