//! Errors shared across the workspace
//!
//! Covers the concerns every binary hits before its own domain errors exist:
//! reading and parsing configuration. Domain errors live in their own crates.

use thiserror::Error;

/// Shared error type for config loading and file access
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;
