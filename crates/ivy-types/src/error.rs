//! Shared error types for the Ivy system.

use thiserror::Error;

/// Top-level error type for the Ivy system.
#[derive(Error, Debug)]
pub enum IvyError {
    /// A configuration value is missing or invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A peer identity or key could not be decoded.
    #[error("Identity error: {0}")]
    Identity(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Alias for Result with IvyError.
pub type IvyResult<T> = Result<T, IvyError>;
