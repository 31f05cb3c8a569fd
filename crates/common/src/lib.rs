//! Shared types for the pool gateway workspace

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
