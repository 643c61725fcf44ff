//! End-to-end classification of one uploaded image.

use std::sync::Arc;
use std::time::Instant;

use image::DynamicImage;
use leaf_core::{
    ChannelOrder, Error, LeafConfig, ModelManifest, PreparedTensor, Result, Session, Verdict,
};
use leaf_vision::Preprocessor;
use tracing::{debug, info, warn};

use crate::artifact::{ArtifactCache, ArtifactSpec, RetryPolicy};
use crate::decision::decide;
use crate::model::{BurnModelLoader, LeafClassifierConfig};
use crate::provider::{ModelHandle, ModelProvider};
use crate::source::HttpSource;

/// Session gate, model provider, preprocessor and confidence gate wired together.
pub struct LeafPipeline {
    provider: Arc<ModelProvider>,
    preprocessor: Preprocessor,
    threshold: f32,
}

impl LeafPipeline {
    pub fn new(provider: Arc<ModelProvider>, preprocessor: Preprocessor, threshold: f32) -> Self {
        Self {
            provider,
            preprocessor,
            threshold,
        }
    }

    /// Builds the production pipeline: HTTP artifact source, Burn loader and
    /// the label manifest, if one is configured.
    ///
    /// Fails with [`Error::Config`] when the configured channel order differs
    /// from the one the manifest declares for the trained model.
    pub fn from_config(config: &LeafConfig) -> Result<Self> {
        let manifest = config
            .model
            .manifest
            .as_deref()
            .map(ModelManifest::load)
            .transpose()?;

        match &manifest {
            Some(manifest) => check_channel_order(config.preprocess.channel_order, manifest)?,
            None => warn!(
                "No model manifest configured; trusting channel order '{}' from config",
                config.preprocess.channel_order
            ),
        }

        let fetch = &config.artifact.fetch;
        let cache = ArtifactCache::new(Arc::new(HttpSource::new(fetch)?))
            .with_retry(RetryPolicy::from_config(fetch));
        let loader = BurnModelLoader::new(LeafClassifierConfig::from_model_config(&config.model));

        let mut provider = ModelProvider::new(
            cache,
            ArtifactSpec::from_config(&config.artifact),
            Arc::new(loader),
        )
        .with_load_timeout(config.model.load_timeout());
        if let Some(manifest) = manifest {
            provider = provider.with_labels(manifest.labels);
        }

        Ok(Self::new(
            Arc::new(provider),
            Preprocessor::new(&config.preprocess),
            config.decision.threshold,
        ))
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn provider(&self) -> &Arc<ModelProvider> {
        &self.provider
    }

    pub fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }

    /// Provisions the model eagerly so the first request does not pay for it.
    pub fn warm_up(&self) -> Result<ModelHandle> {
        Ok(self.provider.get_model()?)
    }

    /// Classifies encoded image bytes for an authorized session.
    pub fn classify(&self, session: &Session, image_bytes: &[u8]) -> Result<Verdict> {
        ensure_authorized(session)?;
        let model = self.provider.get_model()?;
        let tensor = self.preprocessor.prepare_bytes(image_bytes)?;
        self.evaluate(&model, &tensor)
    }

    /// Classifies an already decoded image for an authorized session.
    pub fn classify_image(&self, session: &Session, image: &DynamicImage) -> Result<Verdict> {
        ensure_authorized(session)?;
        let model = self.provider.get_model()?;
        let tensor = self.preprocessor.prepare(image)?;
        self.evaluate(&model, &tensor)
    }

    fn evaluate(&self, model: &ModelHandle, tensor: &PreparedTensor) -> Result<Verdict> {
        let started = Instant::now();
        let scores = model.infer(tensor)?;
        let verdict = decide(&scores, model.labels(), self.threshold);
        debug!("Scores {:?} -> {:?}", scores.as_slice(), verdict);
        info!("Verdict: {} in {:?}", verdict, started.elapsed());
        Ok(verdict)
    }
}

fn ensure_authorized(session: &Session) -> Result<()> {
    if !session.is_authorized() {
        warn!("Rejected classification request from an unauthorized session");
        return Err(Error::Unauthorized);
    }
    Ok(())
}

/// The configured channel order must be the one the model was trained with.
pub fn check_channel_order(configured: ChannelOrder, manifest: &ModelManifest) -> Result<()> {
    match manifest.channel_order {
        Some(trained) if trained != configured => Err(Error::Config(format!(
            "preprocess.channel_order is '{}' but the model was trained on '{}'",
            configured, trained
        ))),
        Some(_) => Ok(()),
        None => {
            warn!(
                "Model manifest does not record a channel order; using '{}'",
                configured
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::tests::{Response, ScriptedSource};
    use crate::provider::tests::{provider_with, CountingLoader};
    use image::{ImageBuffer, ImageFormat, Rgb};
    use leaf_core::{
        ArtifactConfig, InferenceError, LoadError, Outcome, PreprocessConfig, PreprocessError,
    };
    use std::io::Cursor;
    use std::path::Path;

    fn png_bytes() -> Vec<u8> {
        let img = ImageBuffer::from_pixel(40, 30, Rgb([30u8, 160u8, 40u8]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn pipeline(
        dir: &Path,
        source: &Arc<ScriptedSource>,
        loader: &Arc<CountingLoader>,
    ) -> LeafPipeline {
        LeafPipeline::new(
            Arc::new(provider_with(dir, source, loader)),
            Preprocessor::imagenet(ChannelOrder::Bgr),
            leaf_core::DEFAULT_THRESHOLD,
        )
    }

    #[test]
    fn test_classify_confident() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::serving(b"weights"));
        let loader = Arc::new(CountingLoader::new(vec![0.9, 0.1]));
        let pipeline = pipeline(dir.path(), &source, &loader);

        let verdict = pipeline.classify(&Session::authorized(), &png_bytes()).unwrap();
        assert_eq!(verdict.label, "diseased");
        assert_eq!(verdict.outcome, Outcome::Confident);
        assert!(verdict.summary().starts_with("Result: diseased"));
    }

    #[test]
    fn test_classify_ambiguous() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::serving(b"weights"));
        let loader = Arc::new(CountingLoader::new(vec![0.35, 0.65]));
        let pipeline = pipeline(dir.path(), &source, &loader);

        let verdict = pipeline.classify(&Session::authorized(), &png_bytes()).unwrap();
        assert_eq!(verdict.label, "healthy");
        assert_eq!(verdict.outcome, Outcome::Ambiguous);
        assert!(verdict.summary().starts_with("Unclear: healthy"));
    }

    #[test]
    fn test_unauthorized_does_no_work() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::serving(b"weights"));
        let loader = Arc::new(CountingLoader::new(vec![0.9, 0.1]));
        let pipeline = pipeline(dir.path(), &source, &loader);

        let err = pipeline.classify(&Session::anonymous(), &png_bytes()).unwrap_err();
        assert!(matches!(err, Error::Unauthorized));
        assert_eq!(source.opens(), 0);
        assert_eq!(loader.loads(), 0);
    }

    #[test]
    fn test_bad_upload_keeps_model_usable() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::serving(b"weights"));
        let loader = Arc::new(CountingLoader::new(vec![0.2, 0.8]));
        let pipeline = pipeline(dir.path(), &source, &loader);
        let session = Session::authorized();

        let err = pipeline.classify(&session, b"not an image").unwrap_err();
        assert!(matches!(
            err,
            Error::Preprocess(PreprocessError::UnsupportedFormat(_))
        ));

        let verdict = pipeline.classify(&session, &png_bytes()).unwrap();
        assert_eq!(verdict.label, "healthy");
        assert_eq!(loader.loads(), 1);
        assert_eq!(source.opens(), 1);
    }

    #[test]
    fn test_provisioning_failure_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::scripted(vec![Response::Status(404)], b"weights"));
        let loader = Arc::new(CountingLoader::new(vec![0.9, 0.1]));
        let pipeline = pipeline(dir.path(), &source, &loader);

        let err = pipeline.classify(&Session::authorized(), &png_bytes()).unwrap_err();
        assert!(err.is_provisioning_failure());
        assert!(matches!(
            err,
            Error::Load(LoadError::ArtifactUnavailable(_))
        ));
        assert_eq!(loader.loads(), 0);
    }

    #[test]
    fn test_nan_scores_are_an_inference_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::serving(b"weights"));
        let loader = Arc::new(CountingLoader::new(vec![f32::NAN, f32::NAN]));
        let pipeline = pipeline(dir.path(), &source, &loader);

        let err = pipeline.classify(&Session::authorized(), &png_bytes()).unwrap_err();
        assert!(matches!(
            err,
            Error::Inference(InferenceError::Backend(_))
        ));
        assert!(!err.is_provisioning_failure());
    }

    #[test]
    fn test_partly_nan_scores_give_no_verdict() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::serving(b"weights"));
        let loader = Arc::new(CountingLoader::new(vec![f32::NAN, 0.4]));
        let pipeline = pipeline(dir.path(), &source, &loader);

        let image = DynamicImage::new_rgb8(32, 32);
        assert!(matches!(
            pipeline.classify_image(&Session::authorized(), &image),
            Err(Error::Inference(_))
        ));
    }

    #[test]
    fn test_warm_up_loads_once() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::serving(b"weights"));
        let loader = Arc::new(CountingLoader::new(vec![0.9, 0.1]));
        let pipeline = pipeline(dir.path(), &source, &loader);

        pipeline.warm_up().unwrap();
        assert!(pipeline.provider().is_loaded());
        pipeline.classify(&Session::authorized(), &png_bytes()).unwrap();
        assert_eq!(loader.loads(), 1);
    }

    #[test]
    fn test_threshold_override() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::serving(b"weights"));
        let loader = Arc::new(CountingLoader::new(vec![0.9, 0.1]));
        let pipeline = pipeline(dir.path(), &source, &loader).with_threshold(0.95);

        let image = DynamicImage::new_rgb8(64, 64);
        let verdict = pipeline.classify_image(&Session::authorized(), &image).unwrap();
        assert_eq!(verdict.outcome, Outcome::Ambiguous);
    }

    fn config_with_manifest(dir: &Path, manifest: &str, order: ChannelOrder) -> LeafConfig {
        let manifest_path = dir.join("manifest.json");
        std::fs::write(&manifest_path, manifest).unwrap();

        let mut config = LeafConfig {
            artifact: ArtifactConfig::new(
                "https://models.test/leaf.mpk",
                dir.join("leaf.mpk"),
            ),
            model: Default::default(),
            preprocess: PreprocessConfig::new(order),
            decision: Default::default(),
        };
        config.model.manifest = Some(manifest_path);
        config
    }

    #[test]
    fn test_from_config_rejects_channel_order_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_manifest(
            dir.path(),
            r#"{"labels": ["diseased", "healthy"], "channel_order": "bgr"}"#,
            ChannelOrder::Rgb,
        );
        assert!(matches!(
            LeafPipeline::from_config(&config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_from_config_is_lazy() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_manifest(
            dir.path(),
            r#"{"labels": ["diseased", "healthy"], "channel_order": "bgr"}"#,
            ChannelOrder::Bgr,
        );
        let pipeline = LeafPipeline::from_config(&config).unwrap();
        assert!(!pipeline.provider().is_loaded());
        assert_eq!(pipeline.preprocessor().channel_order(), ChannelOrder::Bgr);
        assert!(!dir.path().join("leaf.mpk").exists());
    }

    #[test]
    fn test_manifest_without_channel_order_is_accepted() {
        let manifest = ModelManifest {
            labels: vec!["diseased".into(), "healthy".into()],
            channel_order: None,
        };
        assert!(check_channel_order(ChannelOrder::Rgb, &manifest).is_ok());
    }
}
