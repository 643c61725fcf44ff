//! Core types and utilities for the leaf disease classifier.
//!
//! This crate provides the types, errors and configuration shared by the
//! preprocessing and inference crates and by the command-line tool.

pub mod cli;
pub mod config;
pub mod error;
pub mod types;

pub use cli::*;
pub use config::*;
pub use error::{Error, FetchError, InferenceError, LoadError, PreprocessError, Result};
pub use types::*;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::types::*;
}
