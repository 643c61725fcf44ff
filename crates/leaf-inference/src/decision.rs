//! Confidence-gated verdicts.

use leaf_core::{ClassLabelSet, Outcome, PredictionVector, Verdict};

/// Turns a prediction vector into a verdict.
///
/// The winning class is the first index holding the maximum score. The
/// verdict is confident only when that score is strictly above `threshold`.
///
/// # Panics
///
/// If `scores` has no usable (non-NaN) entry, or the winning index has no
/// label. Both mean the model and its label set disagree, which provisioning
/// already rules out.
pub fn decide(scores: &PredictionVector, labels: &ClassLabelSet, threshold: f32) -> Verdict {
    let class_id = scores.argmax().unwrap_or_else(|| {
        panic!(
            "prediction vector has no usable score: {:?}",
            scores.as_slice()
        )
    });
    let label = labels.get(class_id).unwrap_or_else(|| {
        panic!(
            "class index {} outside label set of {} entries",
            class_id,
            labels.len()
        )
    });

    let confidence = scores.as_slice()[class_id];
    let outcome = if confidence > threshold {
        Outcome::Confident
    } else {
        Outcome::Ambiguous
    };

    Verdict {
        label: label.to_string(),
        class_id,
        confidence,
        outcome,
    }
}
