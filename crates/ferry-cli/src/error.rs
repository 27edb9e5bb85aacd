//! CLI error type.

use std::path::PathBuf;

use ferry_core::MigrationError;
use thiserror::Error;

/// Errors reported by the `ferry` binary.
#[derive(Debug, Error)]
pub enum CliError {
    /// A `--option` flag was not of the form key=value.
    #[error("invalid option '{0}', expected KEY=VALUE")]
    InvalidOption(String),

    /// The configuration file could not be read.
    #[error("cannot read config file {path}: {source}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error from the orchestrator.
    #[error(transparent)]
    Migration(#[from] MigrationError),
}
