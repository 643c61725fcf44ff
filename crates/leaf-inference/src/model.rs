//! CNN architecture of the leaf classifier and its Burn-backed loader.
//!
//! The deployed artifact is a Burn `CompactRecorder` record (`.mpk`) of
//! [`LeafClassifier`]. The record carries weights only, so the architecture
//! parameters in [`ModelConfig`] must match the ones used at training time.

use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
        Relu,
    },
    record::CompactRecorder,
    tensor::{backend::Backend, Tensor},
};
use leaf_core::{InferenceError, LoadError, ModelConfig, PredictionVector, PreparedTensor};
use tracing::{debug, info};

use crate::backend::{default_device, InferenceBackend};
use crate::provider::{Classifier, ModelLoader};

/// Configuration for the LeafClassifier CNN
#[derive(Config, Debug)]
pub struct LeafClassifierConfig {
    /// Number of output classes
    #[config(default = "2")]
    pub num_classes: usize,

    /// Dropout rate of the classifier head
    #[config(default = "0.3")]
    pub dropout_rate: f64,

    /// Number of input channels (3 for RGB/BGR)
    #[config(default = "3")]
    pub in_channels: usize,

    /// Filters in the first convolution block, doubled in every following block
    #[config(default = "32")]
    pub base_filters: usize,

    /// Number of convolution blocks
    #[config(default = "4")]
    pub num_blocks: usize,
}

impl LeafClassifierConfig {
    pub fn from_model_config(config: &ModelConfig) -> Self {
        Self {
            num_classes: config.num_classes,
            dropout_rate: config.dropout,
            in_channels: 3,
            base_filters: config.base_filters,
            num_blocks: config.num_blocks,
        }
    }

    /// Channels coming out of the last convolution block
    pub fn feature_channels(&self) -> usize {
        self.base_filters << self.num_blocks.saturating_sub(1)
    }
}

/// Conv2d, BatchNorm, ReLU and a 2x2 max pool
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
    pub relu: Relu,
    pub pool: MaxPool2d,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);

        Self {
            conv,
            bn: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        let x = self.relu.forward(x);
        self.pool.forward(x)
    }
}

/// Leaf disease classifier
///
/// Architecture:
/// - `num_blocks` convolution blocks, filters doubling each block
/// - Global average pooling
/// - Two fully connected layers with dropout in between
#[derive(Module, Debug)]
pub struct LeafClassifier<B: Backend> {
    pub blocks: Vec<ConvBlock<B>>,
    pub global_pool: AdaptiveAvgPool2d,
    pub fc1: Linear<B>,
    pub dropout: Dropout,
    pub fc2: Linear<B>,
    num_classes: usize,
}

impl<B: Backend> LeafClassifier<B> {
    pub fn new(config: &LeafClassifierConfig, device: &B::Device) -> Self {
        let mut blocks = Vec::with_capacity(config.num_blocks);
        let mut in_channels = config.in_channels;
        for i in 0..config.num_blocks {
            let out_channels = config.base_filters << i;
            blocks.push(ConvBlock::new(in_channels, out_channels, device));
            in_channels = out_channels;
        }

        let features = config.feature_channels();
        Self {
            blocks,
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc1: LinearConfig::new(features, 256).init(device),
            dropout: DropoutConfig::new(config.dropout_rate).init(),
            fc2: LinearConfig::new(256, config.num_classes).init(device),
            num_classes: config.num_classes,
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Input tensor of shape [batch_size, 3, height, width]
    ///
    /// # Returns
    /// * Logits tensor of shape [batch_size, num_classes]
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = x;
        for block in &self.blocks {
            x = block.forward(x);
        }

        // [B, C, H, W] -> [B, C, 1, 1] -> [B, C]
        let x = self.global_pool.forward(x);
        let [batch_size, channels, _, _] = x.dims();
        let x = x.reshape([batch_size, channels]);

        let x = self.fc1.forward(x);
        let x = Relu::new().forward(x);
        let x = self.dropout.forward(x);
        self.fc2.forward(x)
    }

    /// Forward pass with softmax for inference
    pub fn forward_softmax(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        burn::tensor::activation::softmax(self.forward(x), 1)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
}

/// Loads `.mpk` records into a [`LeafClassifier`].
pub struct BurnModelLoader<B: Backend = InferenceBackend> {
    config: LeafClassifierConfig,
    device: B::Device,
}

impl BurnModelLoader<InferenceBackend> {
    /// Loader on the default device of the compiled-in backend
    pub fn new(config: LeafClassifierConfig) -> Self {
        Self::with_device(config, default_device())
    }
}

impl<B: Backend> BurnModelLoader<B> {
    pub fn with_device(config: LeafClassifierConfig, device: B::Device) -> Self {
        Self { config, device }
    }

    pub fn config(&self) -> &LeafClassifierConfig {
        &self.config
    }

    /// Deserializes the record at `path` into a ready-to-run classifier.
    pub fn load_classifier(&self, path: &Path) -> Result<BurnClassifier<B>, LoadError> {
        let started = Instant::now();
        let recorder = CompactRecorder::new();
        let model = LeafClassifier::<B>::new(&self.config, &self.device)
            .load_file(path.to_path_buf(), &recorder, &self.device)
            .map_err(|e| {
                LoadError::CorruptArtifact(format!("{}: {:?}", path.display(), e))
            })?;

        info!(
            "Loaded leaf classifier from {:?} in {:.2}s ({} classes, {} blocks)",
            path,
            started.elapsed().as_secs_f64(),
            model.num_classes(),
            model.blocks.len()
        );
        Ok(BurnClassifier::new(model, self.device.clone()))
    }
}

impl<B: Backend> ModelLoader for BurnModelLoader<B> {
    fn load(&self, path: &Path) -> Result<Box<dyn Classifier>, LoadError> {
        Ok(Box::new(self.load_classifier(path)?))
    }
}

/// A loaded classifier bound to its device.
pub struct BurnClassifier<B: Backend> {
    model: Mutex<LeafClassifier<B>>,
    device: B::Device,
    width: usize,
}

impl<B: Backend> BurnClassifier<B> {
    pub fn new(model: LeafClassifier<B>, device: B::Device) -> Self {
        let width = model.num_classes();
        Self {
            model: Mutex::new(model),
            device,
            width,
        }
    }
}

impl<B: Backend> Classifier for BurnClassifier<B> {
    fn output_width(&self) -> usize {
        self.width
    }

    fn infer(&self, input: &PreparedTensor) -> Result<PredictionVector, InferenceError> {
        let [batch, height, width, channels] = input.shape();
        let nchw = input.to_nchw();

        let tensor: Tensor<B, 1> = Tensor::from_floats(&nchw[..], &self.device);
        let tensor: Tensor<B, 4> = tensor.reshape([batch, channels, height, width]);

        let started = Instant::now();
        let probs = {
            let model = self.model.lock().unwrap_or_else(PoisonError::into_inner);
            model.forward_softmax(tensor)
        };
        let scores: Vec<f32> = probs
            .into_data()
            .to_vec()
            .map_err(|e| InferenceError::Backend(format!("{:?}", e)))?;
        debug!("Forward pass took {:?}", started.elapsed());

        if scores.len() != self.width {
            return Err(InferenceError::WidthMismatch {
                expected: self.width,
                actual: scores.len(),
            });
        }
        Ok(PredictionVector::new(scores))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use leaf_core::ChannelOrder;

    type TestBackend = NdArray;

    fn tiny_config(num_classes: usize) -> LeafClassifierConfig {
        LeafClassifierConfig::new()
            .with_num_classes(num_classes)
            .with_base_filters(4)
            .with_num_blocks(2)
    }

    fn input(side: usize) -> PreparedTensor {
        let data = (0..side * side * 3).map(|i| (i % 255) as f32 / 255.0).collect();
        PreparedTensor::new(data, side, side, ChannelOrder::Rgb).unwrap()
    }

    #[test]
    fn test_forward_shape() {
        let device = Default::default();
        let model: LeafClassifier<TestBackend> = LeafClassifier::new(&tiny_config(3), &device);
        let x = Tensor::<TestBackend, 4>::zeros([2, 3, 16, 16], &device);
        assert_eq!(model.forward(x).dims(), [2, 3]);
    }

    #[test]
    fn test_feature_channels() {
        let config = LeafClassifierConfig::new();
        assert_eq!(config.feature_channels(), 256);
        assert_eq!(tiny_config(2).feature_channels(), 8);
    }

    #[test]
    fn test_save_then_load_and_infer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leaf.mpk");
        let device = Default::default();

        let model: LeafClassifier<TestBackend> = LeafClassifier::new(&tiny_config(2), &device);
        model.save_file(path.clone(), &CompactRecorder::new()).unwrap();
        assert!(path.exists());

        let loader = BurnModelLoader::<TestBackend>::with_device(tiny_config(2), device);
        let classifier = loader.load(&path).unwrap();
        assert_eq!(classifier.output_width(), 2);

        let scores = classifier.infer(&input(16)).unwrap();
        assert_eq!(scores.len(), 2);
        let total: f32 = scores.as_slice().iter().sum();
        assert!((total - 1.0).abs() < 1e-4);
        assert!(scores.as_slice().iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn test_inference_is_deterministic() {
        let device = Default::default();
        let model: LeafClassifier<TestBackend> = LeafClassifier::new(&tiny_config(2), &device);
        let classifier = BurnClassifier::new(model, device);

        let a = classifier.infer(&input(12)).unwrap();
        let b = classifier.infer(&input(12)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_garbage_record_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leaf.mpk");
        std::fs::write(&path, b"<html>not a model</html>").unwrap();

        let loader =
            BurnModelLoader::<TestBackend>::with_device(tiny_config(2), Default::default());
        assert!(matches!(loader.load(&path), Err(LoadError::CorruptArtifact(_))));
    }

    #[test]
    fn test_missing_record_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let loader =
            BurnModelLoader::<TestBackend>::with_device(tiny_config(2), Default::default());
        assert!(matches!(
            loader.load(&dir.path().join("absent.mpk")),
            Err(LoadError::CorruptArtifact(_))
        ));
    }
}
