//! Error types for the leaf disease classification pipeline.
//!
//! Each stage of the pipeline has its own error enum so callers can tell a
//! provisioning failure (which blocks every request) apart from a bad upload
//! (which only fails the current one). [`Error`] wraps all of them for the
//! pipeline entry point.

use thiserror::Error;

/// Failure to bring the model artifact onto local storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The remote answered with a status other than 200
    #[error("remote rejected artifact request with status {0}")]
    RemoteRejected(u16),

    /// Connection, timeout or body transfer failure
    #[error("transport error: {0}")]
    TransportError(String),

    /// The artifact could not be written to local storage
    #[error("storage error: {0}")]
    Storage(String),

    /// The downloaded payload does not match the pinned digest
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

impl FetchError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::TransportError(_))
    }
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        FetchError::Storage(err.to_string())
    }
}

/// Failure to construct the in-memory model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// The artifact could not be fetched
    #[error("model artifact unavailable: {0}")]
    ArtifactUnavailable(#[from] FetchError),

    /// The artifact is present but could not be deserialized
    #[error("corrupt model artifact: {0}")]
    CorruptArtifact(String),

    /// The label manifest does not line up with the model output
    #[error("label manifest lists {labels} labels but the model predicts {width} classes")]
    LabelMismatch { labels: usize, width: usize },
}

/// Failure to turn an input image into a tensor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreprocessError {
    /// The bytes are not a decodable image or yield no pixels
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
}

impl From<image::ImageError> for PreprocessError {
    fn from(err: image::ImageError) -> Self {
        PreprocessError::UnsupportedFormat(err.to_string())
    }
}

/// Failure while running the loaded model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InferenceError {
    /// The numeric backend failed to produce output
    #[error("backend error: {0}")]
    Backend(String),

    /// The model produced a vector of unexpected width
    #[error("model produced {actual} scores, expected {expected}")]
    WidthMismatch { expected: usize, actual: usize },
}

/// Top-level error for the classification pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The caller's session has not passed the auth gate
    #[error("session is not authorized")]
    Unauthorized,

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Preprocess(#[from] PreprocessError),

    #[error(transparent)]
    Inference(#[from] InferenceError),
}

impl Error {
    /// Whether this error leaves the model unusable for later requests.
    pub fn is_provisioning_failure(&self) -> bool {
        matches!(self, Error::Fetch(_) | Error::Load(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Specialized Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;
