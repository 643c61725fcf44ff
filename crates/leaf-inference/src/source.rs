//! Remote sources for the model artifact.

use std::io::Read;
use std::time::Duration;

use leaf_core::{FetchConfig, FetchError};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use tracing::debug;

/// An opened remote artifact: its advertised size and a streaming body.
pub struct RemoteArtifact {
    /// `Content-Length`, when the remote advertised one
    pub content_length: Option<u64>,
    /// Response body, read incrementally
    pub body: Box<dyn Read + Send>,
}

impl RemoteArtifact {
    pub fn new(content_length: Option<u64>, body: impl Read + Send + 'static) -> Self {
        Self {
            content_length,
            body: Box::new(body),
        }
    }
}

/// Where artifact bytes come from.
///
/// Implementations must return [`FetchError::RemoteRejected`] for any status
/// other than 200 and [`FetchError::TransportError`] for connection problems.
pub trait ArtifactSource: Send + Sync {
    fn open(&self, locator: &str) -> Result<RemoteArtifact, FetchError>;
}

/// HTTP(S) source backed by a blocking `reqwest` client.
pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        Self::with_timeouts(config.timeout(), config.connect_timeout())
    }

    pub fn with_timeouts(timeout: Duration, connect_timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .user_agent(concat!("leaf-inference/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::TransportError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl ArtifactSource for HttpSource {
    fn open(&self, locator: &str) -> Result<RemoteArtifact, FetchError> {
        debug!("GET {}", locator);
        let response = self
            .client
            .get(locator)
            .send()
            .map_err(|e| FetchError::TransportError(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchError::RemoteRejected(status.as_u16()));
        }

        let content_length = response.content_length();
        debug!("{} answered 200, content length {:?}", locator, content_length);
        Ok(RemoteArtifact::new(content_length, response))
    }
}
