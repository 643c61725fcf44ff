//! Memoized, single-flight access to the loaded classifier.
//!
//! The first [`ModelProvider::get_model`] call fetches the artifact and
//! deserializes it. Callers that arrive while that flight is running wait for
//! it and receive the same handle or the same error. A successful handle is
//! kept for the lifetime of the provider; after a failed flight the next
//! caller starts a fresh one.
//!
//! # Thread Safety
//!
//! - `Mutex<ProviderState>` serializes flights
//! - `completed_flights` lets a waiter tell whether the failure it finds
//!   belongs to a flight it waited on
//! - `ModelHandle` is `Clone + Send + Sync`

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use leaf_core::{ClassLabelSet, InferenceError, LoadError, PredictionVector, PreparedTensor};
use tracing::{debug, error, info, warn};

use crate::artifact::{ArtifactCache, ArtifactRecord, ArtifactSpec};

/// A loaded model that maps a prepared tensor to class scores.
pub trait Classifier: Send + Sync {
    /// Length of every prediction vector this classifier returns
    fn output_width(&self) -> usize;

    fn infer(&self, input: &PreparedTensor) -> Result<PredictionVector, InferenceError>;
}

/// Deserializes a local artifact into a [`Classifier`].
pub trait ModelLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Box<dyn Classifier>, LoadError>;
}

/// Shared handle to the loaded model, its labels and the artifact it came from.
#[derive(Clone)]
pub struct ModelHandle {
    classifier: Arc<dyn Classifier>,
    labels: Arc<ClassLabelSet>,
    artifact: ArtifactRecord,
}

impl ModelHandle {
    pub fn output_width(&self) -> usize {
        self.classifier.output_width()
    }

    /// Runs the model on one prepared image.
    ///
    /// Every score must be finite and non-negative; anything else means the
    /// backend misbehaved and is reported instead of turned into a verdict.
    pub fn infer(&self, input: &PreparedTensor) -> Result<PredictionVector, InferenceError> {
        let started = Instant::now();
        let scores = self.classifier.infer(input)?;
        if scores.len() != self.output_width() {
            return Err(InferenceError::WidthMismatch {
                expected: self.output_width(),
                actual: scores.len(),
            });
        }
        if let Some((index, score)) = scores
            .as_slice()
            .iter()
            .enumerate()
            .find(|(_, s)| !s.is_finite() || **s < 0.0)
        {
            return Err(InferenceError::Backend(format!(
                "score {} at index {} is not a finite non-negative number",
                score, index
            )));
        }
        debug!("Inference produced {:?} in {:?}", scores.as_slice(), started.elapsed());
        Ok(scores)
    }

    pub fn labels(&self) -> &ClassLabelSet {
        &self.labels
    }

    pub fn artifact(&self) -> &ArtifactRecord {
        &self.artifact
    }

    /// Whether two handles share the same loaded model
    pub fn same_model(&self, other: &ModelHandle) -> bool {
        Arc::ptr_eq(&self.classifier, &other.classifier)
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("output_width", &self.output_width())
            .field("labels", &self.labels)
            .field("artifact", &self.artifact)
            .finish()
    }
}

/// Result channel of a deserialization running on the loader thread.
type PendingLoad = mpsc::Receiver<Result<Box<dyn Classifier>, LoadError>>;

/// State machine:
/// - `handle: None, last_failure: None` -> not loaded yet
/// - `handle: None, last_failure: Some` -> most recent flight failed
/// - `handle: Some` -> ready, never changes again
///
/// `pending_load` holds a load that outlived its flight's timeout; the next
/// flight waits on it instead of starting another one.
#[derive(Default)]
struct ProviderState {
    handle: Option<ModelHandle>,
    last_failure: Option<(u64, LoadError)>,
    pending_load: Option<PendingLoad>,
}

/// Owns the artifact cache and the model loader, and hands out the handle.
pub struct ModelProvider {
    cache: ArtifactCache,
    spec: ArtifactSpec,
    loader: Arc<dyn ModelLoader>,
    manifest_labels: Option<Vec<String>>,
    load_timeout: Option<Duration>,
    state: Mutex<ProviderState>,
    completed_flights: AtomicU64,
}

impl ModelProvider {
    pub fn new(cache: ArtifactCache, spec: ArtifactSpec, loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            cache,
            spec,
            loader,
            manifest_labels: None,
            load_timeout: None,
            state: Mutex::new(ProviderState::default()),
            completed_flights: AtomicU64::new(0),
        }
    }

    /// Labels in output-index order, checked against the model once loaded
    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.manifest_labels = Some(labels);
        self
    }

    /// Upper bound on deserialization time
    pub fn with_load_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.load_timeout = timeout;
        self
    }

    pub fn artifact_spec(&self) -> &ArtifactSpec {
        &self.spec
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// Returns the memoized handle, fetching and loading on first use.
    pub fn get_model(&self) -> Result<ModelHandle, LoadError> {
        let observed = self.completed_flights.load(Ordering::SeqCst);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(handle) = &state.handle {
            return Ok(handle.clone());
        }

        // A flight finished while we were waiting for the lock: share its outcome.
        if let Some((flight, err)) = &state.last_failure {
            if *flight > observed {
                debug!("Sharing failure of model flight {}", flight);
                return Err(err.clone());
            }
        }

        let flight = self.completed_flights.load(Ordering::SeqCst) + 1;
        info!("Provisioning model (flight {})", flight);
        let started = Instant::now();
        let result = self.provision(&mut state.pending_load);

        match &result {
            Ok(handle) => {
                info!(
                    "Model ready in {:.2}s: {} outputs, labels {:?}",
                    started.elapsed().as_secs_f64(),
                    handle.output_width(),
                    handle.labels().iter().collect::<Vec<_>>()
                );
                state.handle = Some(handle.clone());
                state.last_failure = None;
            }
            Err(err) => {
                error!("Model provisioning failed (flight {}): {}", flight, err);
                state.last_failure = Some((flight, err.clone()));
            }
        }
        self.completed_flights.store(flight, Ordering::SeqCst);
        result
    }

    /// The loaded handle, if any, without blocking or triggering a load.
    pub fn peek(&self) -> Option<ModelHandle> {
        match self.state.try_lock() {
            Ok(state) => state.handle.clone(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().handle.clone(),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.peek().is_some()
    }

    fn provision(&self, pending: &mut Option<PendingLoad>) -> Result<ModelHandle, LoadError> {
        let artifact = self.cache.ensure_local(&self.spec)?;
        let classifier: Arc<dyn Classifier> = Arc::from(self.load_with_timeout(pending)?);

        let width = classifier.output_width();
        let labels = match &self.manifest_labels {
            Some(labels) => ClassLabelSet::from_manifest(labels, width)?,
            None => {
                let labels = ClassLabelSet::for_width(width);
                warn!(
                    "No label manifest configured, using default labels {:?}",
                    labels.iter().collect::<Vec<_>>()
                );
                labels
            }
        };

        Ok(ModelHandle {
            classifier,
            labels: Arc::new(labels),
            artifact,
        })
    }

    /// Runs the loader, bounded by `load_timeout` when one is set.
    ///
    /// A load that times out keeps running and is parked in `pending`; the
    /// next call collects its result rather than deserializing again.
    fn load_with_timeout(
        &self,
        pending: &mut Option<PendingLoad>,
    ) -> Result<Box<dyn Classifier>, LoadError> {
        let Some(timeout) = self.load_timeout else {
            return self.loader.load(&self.spec.local_path);
        };

        let rx = match pending.take() {
            Some(rx) => {
                info!("Waiting on a model load started by an earlier flight");
                rx
            }
            None => self.spawn_load(self.spec.local_path.clone())?,
        };

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Model load still running after {:?}; keeping it for the next flight",
                    timeout
                );
                *pending = Some(rx);
                Err(LoadError::CorruptArtifact(format!(
                    "deserialization did not finish within {:?}",
                    timeout
                )))
            }
            Err(RecvTimeoutError::Disconnected) => Err(LoadError::CorruptArtifact(
                "model loader thread panicked".into(),
            )),
        }
    }

    fn spawn_load(&self, path: PathBuf) -> Result<PendingLoad, LoadError> {
        let loader = Arc::clone(&self.loader);
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("model-loader".into())
            .spawn(move || {
                // The receiver is gone if the provider was dropped meanwhile.
                let _ = tx.send(loader.load(&path));
            })
            .map_err(|e| {
                LoadError::CorruptArtifact(format!("failed to spawn loader thread: {e}"))
            })?;
        Ok(rx)
    }
}
