//! Configuration structures for the classification pipeline.
//!
//! The whole pipeline is configured from one TOML file (see
//! `config/leaf.toml`). Everything except the artifact URL and the channel
//! order has a default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{ChannelOrder, ImageDimensions};

/// Default confidence threshold for a confident verdict
pub const DEFAULT_THRESHOLD: f32 = 0.70;

/// Main pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeafConfig {
    /// Where the model artifact comes from and where it is cached
    pub artifact: ArtifactConfig,
    /// Model construction parameters
    #[serde(default)]
    pub model: ModelConfig,
    /// Image preprocessing parameters
    pub preprocess: PreprocessConfig,
    /// Confidence gate
    #[serde(default)]
    pub decision: DecisionConfig,
}

impl LeafConfig {
    /// Checks every section, returning the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.artifact.validate()?;
        self.model.validate()?;
        self.preprocess.validate()?;
        self.decision.validate()?;
        Ok(())
    }

    /// Resolves relative paths against `base` (usually the config file's directory).
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.artifact.path.is_relative() {
            self.artifact.path = base.join(&self.artifact.path);
        }
        if let Some(manifest) = &self.model.manifest {
            if manifest.is_relative() {
                self.model.manifest = Some(base.join(manifest));
            }
        }
    }
}

/// Model artifact source and cache location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
    /// Remote locator of the serialized model
    pub url: String,
    /// Local cache path (must be a `.mpk` record file)
    #[serde(default = "default_artifact_path")]
    pub path: PathBuf,
    /// Optional pinned SHA-256 of the artifact (lowercase hex)
    #[serde(default)]
    pub sha256: Option<String>,
    /// Network behaviour of the fetch
    #[serde(default)]
    pub fetch: FetchConfig,
}

fn default_artifact_path() -> PathBuf {
    PathBuf::from("models/leaf_classifier.mpk")
}

impl ArtifactConfig {
    pub fn new(url: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            path: path.into(),
            sha256: None,
            fetch: FetchConfig::default(),
        }
    }

    fn validate(&self) -> Result<()> {
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "artifact.url must be an http(s) URL, got '{}'",
                self.url
            )));
        }
        if self.path.extension().and_then(|e| e.to_str()) != Some("mpk") {
            return Err(Error::Config(format!(
                "artifact.path must end in .mpk, got {}",
                self.path.display()
            )));
        }
        if let Some(digest) = &self.sha256 {
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(Error::Config(format!(
                    "artifact.sha256 must be 64 hex characters, got '{}'",
                    digest
                )));
            }
        }
        self.fetch.validate()
    }
}

/// Retry and timeout settings for the artifact download
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Backoff before the first retry
    pub initial_backoff_ms: u64,
    /// Upper bound for the exponential backoff
    pub max_backoff_ms: u64,
    /// Whole-request timeout
    pub timeout_secs: u64,
    /// Connection establishment timeout
    pub connect_timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            timeout_secs: 300,
            connect_timeout_secs: 30,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("artifact.fetch.max_attempts must be at least 1".into()));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(Error::Config(
                "artifact.fetch.initial_backoff_ms exceeds max_backoff_ms".into(),
            ));
        }
        if self.timeout_secs == 0 || self.connect_timeout_secs == 0 {
            return Err(Error::Config("artifact.fetch timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Number of output classes
    pub num_classes: usize,
    /// Filters in the first convolution block
    pub base_filters: usize,
    /// Number of convolution blocks
    pub num_blocks: usize,
    /// Dropout rate of the classifier head (inactive at inference)
    pub dropout: f64,
    /// Optional label manifest shipped with the artifact
    pub manifest: Option<PathBuf>,
    /// Upper bound on deserialization time
    pub load_timeout_secs: Option<u64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_classes: 2,
            base_filters: 32,
            num_blocks: 4,
            dropout: 0.3,
            manifest: None,
            load_timeout_secs: Some(120),
        }
    }
}

impl ModelConfig {
    pub fn load_timeout(&self) -> Option<Duration> {
        self.load_timeout_secs.map(Duration::from_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            return Err(Error::Config("model.num_classes must be at least 1".into()));
        }
        if self.base_filters == 0 || self.num_blocks == 0 {
            return Err(Error::Config(
                "model.base_filters and model.num_blocks must be non-zero".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Config(format!(
                "model.dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }
}

/// Resampling filter used when resizing to the model resolution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResizeFilter {
    Nearest,
    Triangle,
    #[default]
    CatmullRom,
    Gaussian,
    Lanczos3,
}

/// Image preprocessing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessConfig {
    /// Target width in pixels
    #[serde(default = "default_side")]
    pub width: u32,
    /// Target height in pixels
    #[serde(default = "default_side")]
    pub height: u32,
    /// Channel order the model was trained on
    pub channel_order: ChannelOrder,
    /// Resampling filter
    #[serde(default)]
    pub filter: ResizeFilter,
}

fn default_side() -> u32 {
    ImageDimensions::imagenet().width
}

impl PreprocessConfig {
    /// 224x224 with the given channel order
    pub fn new(channel_order: ChannelOrder) -> Self {
        Self {
            width: default_side(),
            height: default_side(),
            channel_order,
            filter: ResizeFilter::default(),
        }
    }

    pub fn dimensions(&self) -> ImageDimensions {
        ImageDimensions::new(self.width, self.height, 3)
    }

    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::Config(format!(
                "preprocess dimensions must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

/// Confidence gate configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// A verdict is confident only when its score is strictly above this
    pub threshold: f32,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl DecisionConfig {
    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(Error::Config(format!(
                "decision.threshold must be in [0, 1], got {}",
                self.threshold
            )));
        }
        Ok(())
    }
}

/// Label manifest shipped alongside the model artifact.
///
/// Records the training-time class index mapping and the channel order the
/// model was trained on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelManifest {
    /// Labels in output-index order
    pub labels: Vec<String>,
    /// Channel order used during training, if recorded
    #[serde(default)]
    pub channel_order: Option<ChannelOrder>,
}

impl ModelManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read manifest {}: {e}", path.display()))
        })?;
        let manifest: ModelManifest = serde_json::from_str(&content)?;
        if manifest.labels.is_empty() {
            return Err(Error::Config(format!(
                "manifest {} lists no labels",
                path.display()
            )));
        }
        Ok(manifest)
    }
}
