//! Core type definitions shared by every stage of the pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Index;

use crate::error::LoadError;

/// Image dimensions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageDimensions {
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
    /// Number of channels (3 for RGB)
    pub channels: u32,
}

impl ImageDimensions {
    pub fn new(width: u32, height: u32, channels: u32) -> Self {
        Self {
            width,
            height,
            channels,
        }
    }

    /// Standard ImageNet dimensions (224x224x3)
    pub fn imagenet() -> Self {
        Self::new(224, 224, 3)
    }

    /// Total number of values in one image
    pub fn total_values(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }
}

/// Order of the colour channels in the last tensor axis.
///
/// This must match what the model saw during training. It is a property of
/// the deployed model, so there is intentionally no `Default`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    /// Red, green, blue
    Rgb,
    /// Blue, green, red
    Bgr,
}

impl ChannelOrder {
    /// Arrange an RGB pixel into this channel order.
    pub fn arrange(&self, [r, g, b]: [u8; 3]) -> [u8; 3] {
        match self {
            ChannelOrder::Rgb => [r, g, b],
            ChannelOrder::Bgr => [b, g, r],
        }
    }
}

impl fmt::Display for ChannelOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelOrder::Rgb => write!(f, "rgb"),
            ChannelOrder::Bgr => write!(f, "bgr"),
        }
    }
}

/// Result of the external auth gate, passed explicitly into the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Session {
    authorized: bool,
}

impl Session {
    pub fn new(authorized: bool) -> Self {
        Self { authorized }
    }

    /// A session that has passed the credential check
    pub fn authorized() -> Self {
        Self::new(true)
    }

    /// A session that has not (yet) passed the credential check
    pub fn anonymous() -> Self {
        Self::new(false)
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized
    }
}

/// Human-readable labels, index-aligned with the model output vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassLabelSet {
    labels: Vec<String>,
}

impl ClassLabelSet {
    /// Label for output index 0 of a two-class model
    pub const DISEASED: &'static str = "diseased";
    /// Label for output index 1 of a two-class model
    pub const HEALTHY: &'static str = "healthy";

    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
        }
    }

    /// Default labels for a model of the given output width.
    ///
    /// Only a two-class model gets the fixed diseased/healthy pair; that
    /// ordering is a contract with the training run and cannot be checked here.
    /// Every other width gets `class_<i>` placeholders.
    pub fn for_width(width: usize) -> Self {
        if width == 2 {
            Self::new([Self::DISEASED, Self::HEALTHY])
        } else {
            Self::new((0..width).map(|i| format!("class_{}", i)))
        }
    }

    /// Labels from a manifest, checked against the model output width.
    pub fn from_manifest(labels: &[String], width: usize) -> Result<Self, LoadError> {
        if labels.len() != width {
            return Err(LoadError::LabelMismatch {
                labels: labels.len(),
                width,
            });
        }
        Ok(Self::new(labels.iter().cloned()))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }
}

impl Index<usize> for ClassLabelSet {
    type Output = str;

    fn index(&self, index: usize) -> &str {
        &self.labels[index]
    }
}

/// A batch-of-one image tensor in NHWC layout with values in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedTensor {
    data: Vec<f32>,
    height: usize,
    width: usize,
    channel_order: ChannelOrder,
}

impl PreparedTensor {
    /// Number of channels in every prepared tensor
    pub const CHANNELS: usize = 3;

    /// Wrap NHWC values. Returns `None` when the length does not match the shape.
    pub fn new(
        data: Vec<f32>,
        height: usize,
        width: usize,
        channel_order: ChannelOrder,
    ) -> Option<Self> {
        if data.len() != height * width * Self::CHANNELS {
            return None;
        }
        Some(Self {
            data,
            height,
            width,
            channel_order,
        })
    }

    /// `[batch, height, width, channels]`
    pub fn shape(&self) -> [usize; 4] {
        [1, self.height, self.width, Self::CHANNELS]
    }

    pub fn channel_order(&self) -> ChannelOrder {
        self.channel_order
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Value at `(y, x, c)` of the single image in the batch
    pub fn value(&self, y: usize, x: usize, c: usize) -> f32 {
        self.data[(y * self.width + x) * Self::CHANNELS + c]
    }

    /// The same values re-laid out as `[batch, channels, height, width]`.
    pub fn to_nchw(&self) -> Vec<f32> {
        let plane = self.height * self.width;
        let mut out = vec![0.0f32; self.data.len()];
        for (i, pixel) in self.data.chunks_exact(Self::CHANNELS).enumerate() {
            for (c, &v) in pixel.iter().enumerate() {
                out[c * plane + i] = v;
            }
        }
        out
    }

    /// `(min, max, mean)` over all values
    pub fn stats(&self) -> (f32, f32, f32) {
        let min = self.data.iter().copied().fold(f32::INFINITY, f32::min);
        let max = self.data.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mean = self.data.iter().sum::<f32>() / self.data.len().max(1) as f32;
        (min, max, mean)
    }
}

/// Raw model output: one score per class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionVector(Vec<f32>);

impl PredictionVector {
    pub fn new(scores: Vec<f32>) -> Self {
        Self(scores)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<f32> {
        self.0.get(index).copied()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Index of the highest score. Ties go to the lowest index; NaN never wins.
    pub fn argmax(&self) -> Option<usize> {
        let mut best: Option<(usize, f32)> = None;
        for (i, &score) in self.0.iter().enumerate() {
            if score.is_nan() {
                continue;
            }
            match best {
                Some((_, top)) if score <= top => {}
                _ => best = Some((i, score)),
            }
        }
        best.map(|(i, _)| i)
    }
}

impl From<Vec<f32>> for PredictionVector {
    fn from(scores: Vec<f32>) -> Self {
        Self::new(scores)
    }
}

/// Whether a verdict cleared the confidence gate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Confident,
    Ambiguous,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Confident => write!(f, "confident"),
            Outcome::Ambiguous => write!(f, "ambiguous"),
        }
    }
}

/// Final answer for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub label: String,
    pub class_id: usize,
    pub confidence: f32,
    pub outcome: Outcome,
}

impl Verdict {
    pub fn is_confident(&self) -> bool {
        self.outcome == Outcome::Confident
    }

    /// Confidence as a percentage, the way the UI shows it
    pub fn confidence_percent(&self) -> f32 {
        self.confidence * 100.0
    }

    /// One-line message for the user.
    pub fn summary(&self) -> String {
        match self.outcome {
            Outcome::Confident => format!(
                "Result: {} (confidence {:.1}%)",
                self.label,
                self.confidence_percent()
            ),
            Outcome::Ambiguous => format!(
                "Unclear: {} ({:.1}%). Please retake the photo more clearly.",
                self.label,
                self.confidence_percent()
            ),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:.1}%, {})",
            self.label,
            self.confidence_percent(),
            self.outcome
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_class_labels() {
        let labels = ClassLabelSet::for_width(2);
        assert_eq!(labels.len(), 2);
        assert_eq!(&labels[0], "diseased");
        assert_eq!(&labels[1], "healthy");
    }

    #[test]
    fn test_three_class_labels_are_generic() {
        let labels = ClassLabelSet::for_width(3);
        let names: Vec<&str> = labels.iter().collect();
        assert_eq!(names, vec!["class_0", "class_1", "class_2"]);
        assert!(labels.iter().all(|l| l != "diseased" && l != "healthy"));
    }

    #[test]
    fn test_manifest_labels_must_match_width() {
        let manifest = vec!["healthy".to_string(), "rust".to_string(), "blight".to_string()];
        let ok = ClassLabelSet::from_manifest(&manifest, 3).unwrap();
        assert_eq!(ok.get(2), Some("blight"));

        let err = ClassLabelSet::from_manifest(&manifest, 2).unwrap_err();
        assert_eq!(err, LoadError::LabelMismatch { labels: 3, width: 2 });
    }

    #[test]
    fn test_argmax_first_occurrence_wins() {
        assert_eq!(PredictionVector::new(vec![0.5, 0.5]).argmax(), Some(0));
        assert_eq!(PredictionVector::new(vec![0.1, 0.3, 0.3]).argmax(), Some(1));
        assert_eq!(PredictionVector::new(vec![0.2, 0.7, 0.1]).argmax(), Some(1));
    }

    #[test]
    fn test_argmax_skips_nan() {
        assert_eq!(PredictionVector::new(vec![f32::NAN, 0.2, 0.1]).argmax(), Some(1));
        assert_eq!(PredictionVector::new(vec![f32::NAN]).argmax(), None);
        assert_eq!(PredictionVector::new(vec![]).argmax(), None);
    }

    #[test]
    fn test_channel_order_arrange() {
        assert_eq!(ChannelOrder::Rgb.arrange([1, 2, 3]), [1, 2, 3]);
        assert_eq!(ChannelOrder::Bgr.arrange([1, 2, 3]), [3, 2, 1]);
    }

    #[test]
    fn test_channel_order_serde() {
        let order: ChannelOrder = serde_json::from_str("\"bgr\"").unwrap();
        assert_eq!(order, ChannelOrder::Bgr);
        assert_eq!(serde_json::to_string(&ChannelOrder::Rgb).unwrap(), "\"rgb\"");
    }

    #[test]
    fn test_prepared_tensor_shape_check() {
        assert!(PreparedTensor::new(vec![0.0; 12], 2, 2, ChannelOrder::Rgb).is_some());
        assert!(PreparedTensor::new(vec![0.0; 11], 2, 2, ChannelOrder::Rgb).is_none());
    }

    #[test]
    fn test_prepared_tensor_to_nchw() {
        // 1x2 image: pixel0 = (1,2,3), pixel1 = (4,5,6)
        let tensor =
            PreparedTensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 1, 2, ChannelOrder::Rgb)
                .unwrap();
        assert_eq!(tensor.shape(), [1, 1, 2, 3]);
        assert_eq!(tensor.to_nchw(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert_eq!(tensor.value(0, 1, 2), 6.0);
    }

    #[test]
    fn test_verdict_summary() {
        let verdict = Verdict {
            label: "diseased".into(),
            class_id: 0,
            confidence: 0.9,
            outcome: Outcome::Confident,
        };
        assert!(verdict.summary().starts_with("Result: diseased"));
        assert!(verdict.summary().contains("90.0%"));

        let unclear = Verdict {
            outcome: Outcome::Ambiguous,
            confidence: 0.55,
            ..verdict
        };
        assert!(unclear.summary().starts_with("Unclear: diseased (55.0%)"));
    }

    #[test]
    fn test_verdict_serializes_outcome_lowercase() {
        let verdict = Verdict {
            label: "healthy".into(),
            class_id: 1,
            confidence: 0.75,
            outcome: Outcome::Confident,
        };
        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["outcome"], "confident");
        assert_eq!(json["label"], "healthy");
    }

    #[test]
    fn test_session_flags() {
        assert!(Session::authorized().is_authorized());
        assert!(!Session::anonymous().is_authorized());
        assert!(!Session::default().is_authorized());
    }

    #[test]
    fn test_image_dimensions() {
        let dims = ImageDimensions::imagenet();
        assert_eq!(dims.total_values(), 224 * 224 * 3);
    }
}
