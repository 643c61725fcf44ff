//! Local cache for the model artifact.
//!
//! The artifact is fetched at most once: a file at the local path is trusted
//! when its size and SHA-256 match the sidecar record written after the
//! download completed (or a digest pinned in the configuration). Downloads
//! stream into a `.part` file that is only renamed into place once complete,
//! so an interrupted transfer never looks like a cache hit.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use leaf_core::{ArtifactConfig, FetchConfig, FetchError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::source::{ArtifactSource, RemoteArtifact};

const CHUNK_SIZE: usize = 64 * 1024;

/// Identity of the model artifact: where it comes from and where it lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSpec {
    pub locator: String,
    pub local_path: PathBuf,
    /// Pinned lowercase hex SHA-256, if any
    pub expected_sha256: Option<String>,
}

impl ArtifactSpec {
    pub fn new(locator: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            locator: locator.into(),
            local_path: local_path.into(),
            expected_sha256: None,
        }
    }

    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        self.expected_sha256 = Some(digest.into().to_ascii_lowercase());
        self
    }

    pub fn from_config(config: &ArtifactConfig) -> Self {
        let spec = Self::new(config.url.clone(), config.path.clone());
        match &config.sha256 {
            Some(digest) => spec.with_sha256(digest.clone()),
            None => spec,
        }
    }

    /// Path of the integrity record kept next to the artifact
    pub fn sidecar_path(&self) -> PathBuf {
        with_suffix(&self.local_path, ".meta.json")
    }

    /// Path the download streams into before it is complete
    pub fn partial_path(&self) -> PathBuf {
        with_suffix(&self.local_path, ".part")
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Integrity record persisted alongside a fetched artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub locator: String,
    pub size: u64,
    pub sha256: String,
    pub fetched_at: DateTime<Utc>,
}

impl ArtifactRecord {
    fn load(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Ignoring unreadable artifact record {:?}: {}", path, e);
                None
            }
        }
    }

    fn save(&self, path: &Path) -> Result<(), FetchError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| FetchError::Storage(format!("failed to encode artifact record: {e}")))?;
        let tmp = with_suffix(path, ".tmp");
        fs::write(&tmp, json)?;
        if let Err(e) = fs::rename(&tmp, path) {
            remove_quietly(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

/// Bounded exponential backoff for transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// A single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&FetchConfig::default())
    }
}

/// Ensures the model artifact is present and intact on local storage.
pub struct ArtifactCache {
    source: Arc<dyn ArtifactSource>,
    retry: RetryPolicy,
    fetch_lock: Mutex<()>,
}

impl ArtifactCache {
    pub fn new(source: Arc<dyn ArtifactSource>) -> Self {
        Self {
            source,
            retry: RetryPolicy::default(),
            fetch_lock: Mutex::new(()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Returns the record of a valid local artifact, fetching it if needed.
    ///
    /// A valid local file short-circuits without touching the network.
    pub fn ensure_local(&self, spec: &ArtifactSpec) -> Result<ArtifactRecord, FetchError> {
        let _guard = self.fetch_lock.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(record) = self.validate_local(spec)? {
            info!("Model artifact cache hit: {:?}", spec.local_path);
            return Ok(record);
        }

        info!("Model artifact not cached, fetching from {}", spec.locator);
        let mut attempt = 1;
        loop {
            match self.download(spec) {
                Ok(record) => return Ok(record),
                Err(err) if err.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        "Artifact fetch attempt {}/{} failed: {}. Retrying in {:?}",
                        attempt, self.retry.max_attempts, err, delay
                    );
                    thread::sleep(delay);
                    attempt += 1;

                    // Something else may have completed the file meanwhile.
                    if let Some(record) = self.validate_local(spec)? {
                        info!("Model artifact appeared at {:?} during retry", spec.local_path);
                        return Ok(record);
                    }
                }
                Err(err) => {
                    warn!("Artifact fetch failed after {} attempt(s): {}", attempt, err);
                    return Err(err);
                }
            }
        }
    }

    /// Checks the local file against its integrity record.
    ///
    /// Returns `Ok(None)` when the file is missing or untrustworthy; an
    /// untrustworthy file is removed so the next fetch starts clean.
    pub fn validate_local(
        &self,
        spec: &ArtifactSpec,
    ) -> Result<Option<ArtifactRecord>, FetchError> {
        let path = &spec.local_path;
        let size = match fs::metadata(path) {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => {
                return Err(FetchError::Storage(format!(
                    "{} exists but is not a regular file",
                    path.display()
                )))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if size == 0 {
            warn!("Cached artifact {:?} is empty, discarding", path);
            self.discard(spec);
            return Ok(None);
        }

        let record = ArtifactRecord::load(&spec.sidecar_path());
        match (&record, &spec.expected_sha256) {
            (Some(record), _) if record.size != size => {
                warn!(
                    "Cached artifact {:?} is {} bytes but record says {}, discarding",
                    path, size, record.size
                );
                self.discard(spec);
                return Ok(None);
            }
            (None, None) => {
                warn!("Cached artifact {:?} has no integrity record, discarding", path);
                self.discard(spec);
                return Ok(None);
            }
            _ => {}
        }

        let started = Instant::now();
        let digest = hash_file(path)?;
        debug!("Hashed {:?} ({} bytes) in {:?}", path, size, started.elapsed());

        let expected = spec
            .expected_sha256
            .as_deref()
            .or(record.as_ref().map(|r| r.sha256.as_str()));
        if expected != Some(digest.as_str()) {
            warn!(
                "Cached artifact {:?} digest {} does not match {:?}, discarding",
                path, digest, expected
            );
            self.discard(spec);
            return Ok(None);
        }

        let record = match record {
            Some(record) if record.sha256 == digest => record,
            _ => {
                // File matches the pinned digest but its record is missing or stale.
                let record = ArtifactRecord {
                    locator: spec.locator.clone(),
                    size,
                    sha256: digest,
                    fetched_at: Utc::now(),
                };
                record.save(&spec.sidecar_path())?;
                info!("Adopted pinned artifact {:?}", path);
                record
            }
        };
        Ok(Some(record))
    }

    fn download(&self, spec: &ArtifactSpec) -> Result<ArtifactRecord, FetchError> {
        let remote = self.source.open(&spec.locator)?;
        let partial = spec.partial_path();

        match stream_to_file(remote, &partial, &spec.locator) {
            Ok((size, digest)) => {
                if let Some(expected) = &spec.expected_sha256 {
                    if *expected != digest {
                        remove_quietly(&partial);
                        return Err(FetchError::ChecksumMismatch {
                            expected: expected.clone(),
                            actual: digest,
                        });
                    }
                }

                // The record goes down first: an artifact at the final path
                // must never be without one.
                let record = ArtifactRecord {
                    locator: spec.locator.clone(),
                    size,
                    sha256: digest,
                    fetched_at: Utc::now(),
                };
                if let Err(e) = record.save(&spec.sidecar_path()) {
                    remove_quietly(&partial);
                    return Err(e);
                }

                if let Err(e) = fs::rename(&partial, &spec.local_path) {
                    remove_quietly(&partial);
                    remove_quietly(&spec.sidecar_path());
                    return Err(e.into());
                }
                info!(
                    "Model artifact stored at {:?} ({} bytes, sha256 {})",
                    spec.local_path, record.size, record.sha256
                );
                Ok(record)
            }
            Err(err) => {
                remove_quietly(&partial);
                Err(err)
            }
        }
    }

    fn discard(&self, spec: &ArtifactSpec) {
        remove_quietly(&spec.local_path);
        remove_quietly(&spec.sidecar_path());
    }
}

/// Streams the body into `dest` chunk by chunk, returning size and digest.
fn stream_to_file(
    mut remote: RemoteArtifact,
    dest: &Path,
    locator: &str,
) -> Result<(u64, String), FetchError> {
    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut file = File::create(dest)?;
    let mut hasher = Sha256::new();
    let mut progress = TransferProgress::new(locator, remote.content_length);
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written: u64 = 0;

    loop {
        let n = match remote.body.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(FetchError::TransportError(format!(
                    "read failed after {} bytes: {}",
                    written, e
                )))
            }
        };
        file.write_all(&buf[..n])?;
        hasher.update(&buf[..n]);
        written += n as u64;
        progress.update(written);
    }

    if written == 0 {
        return Err(FetchError::TransportError("remote sent an empty body".into()));
    }
    if let Some(expected) = remote.content_length {
        if written != expected {
            return Err(FetchError::TransportError(format!(
                "body truncated: received {} of {} bytes",
                written, expected
            )));
        }
    }

    file.sync_all()?;
    progress.finish(written);
    Ok((written, format!("{:x}", hasher.finalize())))
}

fn hash_file(path: &Path) -> Result<String, FetchError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove {:?}: {}", path, e);
        }
    }
}

/// Logs download progress at coarse intervals.
struct TransferProgress {
    locator: String,
    total: Option<u64>,
    next_report: u64,
    step: u64,
    started: Instant,
}

impl TransferProgress {
    const DEFAULT_STEP: u64 = 8 * 1024 * 1024;

    fn new(locator: &str, total: Option<u64>) -> Self {
        let step = total
            .map(|t| (t / 10).max(CHUNK_SIZE as u64))
            .unwrap_or(Self::DEFAULT_STEP);
        Self {
            locator: locator.to_string(),
            total,
            next_report: step,
            step,
            started: Instant::now(),
        }
    }

    fn update(&mut self, written: u64) {
        if written < self.next_report {
            return;
        }
        self.next_report = written + self.step;

        let mib = written as f64 / (1024.0 * 1024.0);
        match self.total {
            Some(total) if total > 0 => info!(
                "Downloading {}: {:.1} MiB ({:.0}%)",
                self.locator,
                mib,
                100.0 * written as f64 / total as f64
            ),
            _ => info!("Downloading {}: {:.1} MiB", self.locator, mib),
        }
    }

    fn finish(&self, written: u64) {
        let elapsed = self.started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            written as f64 / (1024.0 * 1024.0) / elapsed
        } else {
            0.0
        };
        info!(
            "Downloaded {} bytes from {} in {:.2}s ({:.1} MiB/s)",
            written, self.locator, elapsed, rate
        );
    }
}
