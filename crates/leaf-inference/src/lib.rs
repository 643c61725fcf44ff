//! # Leaf Inference
//!
//! Model provisioning and classification for the leaf disease classifier.
//!
//! ## Modules
//!
//! - `source`: where the model artifact bytes come from (HTTP by default)
//! - `artifact`: the local artifact cache with integrity records and retries
//! - `model`: the Burn CNN and the `.mpk` record loader
//! - `provider`: memoized, single-flight access to the loaded model
//! - `decision`: confidence-gated verdicts
//! - `pipeline`: session check, preprocessing, inference and decision in one call
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use leaf_core::{load_leaf_config, Session};
//! use leaf_inference::LeafPipeline;
//!
//! let config = load_leaf_config(Path::new("config/leaf.toml"))?;
//! let pipeline = LeafPipeline::from_config(&config)?;
//! let verdict = pipeline.classify(&Session::authorized(), &upload_bytes)?;
//! println!("{}", verdict.summary());
//! ```

pub mod artifact;
pub mod backend;
pub mod decision;
pub mod model;
pub mod pipeline;
pub mod provider;
pub mod source;

pub use artifact::{ArtifactCache, ArtifactRecord, ArtifactSpec, RetryPolicy};
pub use backend::{backend_name, default_device, InferenceBackend};
pub use decision::decide;
pub use model::{BurnClassifier, BurnModelLoader, LeafClassifier, LeafClassifierConfig};
pub use pipeline::LeafPipeline;
pub use provider::{Classifier, ModelHandle, ModelLoader, ModelProvider};
pub use source::{ArtifactSource, HttpSource, RemoteArtifact};
