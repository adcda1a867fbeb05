//! Configuration error types.

use thiserror::Error;

/// Errors raised while locating, reading or validating configuration.
///
/// All of these are fatal at startup: no worker is spawned from a
/// configuration that failed to load.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly requested config file does not exist.
    #[error("config file not found: {path}")]
    NotFound { path: String },

    /// The file exists but could not be read.
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    /// The file is not valid YAML for the expected shape.
    #[error("failed to parse config: {reason}")]
    Parse { reason: String },

    /// References or values are inconsistent.
    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}
