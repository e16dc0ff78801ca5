use std::fmt;

use serde::{Deserialize, Serialize};

use crate::engine::ProbabilityVector;

/// An immutable classification result describing what was recognized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recognition {
    /// Identifier of the recognized class (the class index), not of the
    /// particular observation.
    pub id: String,
    /// Display label for the class.
    pub label: String,
    /// Relative score in `0.0..=1.0`; higher is better.
    pub confidence: f32,
}

impl Recognition {
    fn new(index: usize, label: &str, confidence: f32) -> Self {
        Self {
            id: index.to_string(),
            label: label.to_string(),
            confidence,
        }
    }
}

impl fmt::Display for Recognition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:.1}%)", self.label, self.confidence * 100.0)
    }
}

/// Converts raw model output into labeled, confidence-ordered predictions.
///
/// Binary output always produces exactly two recognitions in fixed label
/// order, `(labels[0], 1 - p)` then `(labels[1], p)`, regardless of `k`:
/// downstream consumers rely on position 0 being the negative class and
/// position 1 the positive class. Multi-class output is sorted descending
/// by confidence (stable, so ties keep label order) and truncated to `k`;
/// a `k` larger than the label list returns everything.
#[must_use]
pub fn rank(output: &ProbabilityVector, labels: &[String], k: usize) -> Vec<Recognition> {
    match output {
        ProbabilityVector::Binary(p) => {
            let (Some(negative), Some(positive)) = (labels.first(), labels.get(1)) else {
                return Vec::new();
            };
            vec![
                Recognition::new(0, negative, 1.0 - p),
                Recognition::new(1, positive, *p),
            ]
        }
        ProbabilityVector::PerClass(probabilities) => {
            let mut recognitions: Vec<Recognition> = labels
                .iter()
                .zip(probabilities.iter())
                .enumerate()
                .map(|(index, (label, &confidence))| Recognition::new(index, label, confidence))
                .collect();
            recognitions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
            recognitions.truncate(k);
            recognitions
        }
    }
}
