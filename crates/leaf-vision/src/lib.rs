//! Image decoding and preprocessing for the leaf disease classifier.
//!
//! Every request passes through [`Preprocessor::prepare`] before it reaches
//! the model, so this crate owns the tensor layout contract: NHWC, batch of
//! one, values in `[0, 1]`, channel order as configured.

pub mod loader;
pub mod preprocess;

pub use loader::{decode_bytes, decode_file};
pub use preprocess::Preprocessor;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::loader::*;
    pub use crate::preprocess::*;
}
