use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tensor::InputTensor;

// ============================================================================
// Errors (sanitized for external consumption)
// ============================================================================

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("inference engine unavailable")]
    Unavailable,

    #[error("model configuration mismatch: {0}")]
    ConfigMismatch(String),

    #[error("invalid model output shape: expected {expected}, got {got}")]
    InvalidOutputShape { expected: String, got: String },

    #[error("inference engine error")]
    Engine(String), // Sanitized - no raw backend errors

    #[error("failed to load model resources")]
    Io(#[from] std::io::Error),
}

#[cfg(feature = "ml")]
impl From<ort::Error> for EngineError {
    fn from(e: ort::Error) -> Self {
        // Log full error internally, return sanitized version externally
        tracing::error!(error = %e, "ORT inference error");
        EngineError::Engine("internal inference error".into())
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Execution backend for the classification model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Device {
    #[default]
    Cpu,
    Gpu,
    Nnapi,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub device: Device,
    pub thread_count: usize,
    /// Two-class model with a single positive-class output.
    pub binary: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            thread_count: 2,
            binary: false,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    #[must_use]
    pub fn with_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    #[must_use]
    pub fn binary_classifier(mut self) -> Self {
        self.binary = true;
        self
    }

    #[must_use]
    pub fn validated(mut self) -> Self {
        self.thread_count = self.thread_count.clamp(1, 16);
        self
    }
}

// ============================================================================
// Labels
// ============================================================================

/// Ordered class labels, aligned 1:1 with the model's output vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Labels(Vec<String>);

impl Labels {
    /// Parses newline-delimited label file contents; blank lines ignored.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        Self(
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(ToString::to_string)
                .collect(),
        )
    }

    #[must_use]
    pub fn new(labels: Vec<String>) -> Self {
        Self(labels)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Checks the label count against the classifier shape: a binary model
    /// carries exactly two labels, a multi-class model at least one.
    pub fn validate(&self, binary: bool) -> Result<(), EngineError> {
        if binary && self.len() != 2 {
            return Err(EngineError::ConfigMismatch(format!(
                "binary classifier requires exactly 2 labels, got {}",
                self.len()
            )));
        }
        if self.is_empty() {
            return Err(EngineError::ConfigMismatch("label file is empty".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Output
// ============================================================================

/// Raw model output, shaped by the classifier kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProbabilityVector {
    /// Positive-class probability of a two-class model.
    Binary(f32),
    /// Per-class probabilities aligned with the label list. Assumed (not
    /// enforced) to sum to ~1.
    PerClass(Vec<f32>),
}

// ============================================================================
// Engine seam
// ============================================================================

/// A loaded classification model plus its execution backend.
///
/// The core only requires that `run` is safe to call repeatedly with
/// freshly built tensors and produces a deterministic output shape. The
/// engine is owned exclusively by the inference worker while attached and
/// is released exactly once (`Drop`) when the worker exits.
///
/// Implementations wrapping a separately released handle must fail with
/// `EngineError::Unavailable` when `run` is called before the model is
/// loaded or after it was released, rather than blocking or panicking.
pub trait InferenceEngine: Send {
    /// Spatial input size `(width, height)` the model expects.
    fn input_size(&self) -> (u32, u32);

    /// Class labels aligned with the model output.
    fn labels(&self) -> &Labels;

    /// One forward pass over a freshly assembled tensor.
    fn run(&self, tensor: InputTensor) -> Result<ProbabilityVector, EngineError>;
}

#[cfg(feature = "ml")]
pub use ort_engine::OrtEngine;

#[cfg(feature = "ml")]
mod ort_engine {
    use std::path::Path;
    use std::sync::Mutex;

    use ort::execution_providers::{CUDAExecutionProvider, NNAPIExecutionProvider};
    use ort::session::Session;
    use tracing::{debug, instrument};

    use super::{Device, EngineConfig, EngineError, InferenceEngine, Labels, ProbabilityVector};
    use crate::tensor::InputTensor;

    /// ONNX Runtime backed classifier.
    ///
    /// `run` is serialized behind a mutex: the session is not assumed
    /// reentrant, and the pipeline guarantees at most one in-flight call
    /// anyway by running inference on a single worker thread.
    pub struct OrtEngine {
        session: Mutex<Session>,
        labels: Labels,
        input_width: u32,
        input_height: u32,
        output_name: String,
        output_classes: usize,
        binary: bool,
    }

    impl OrtEngine {
        /// Loads a model from ONNX bytes and validates it against the
        /// labels and config.
        ///
        /// # Errors
        ///
        /// `ConfigMismatch` if the label count does not fit the classifier
        /// shape or the model's tensor shapes are not the expected fused
        /// `[1, H, W, 4]` input / `[1, N]` output.
        #[instrument(skip(model_bytes, labels), fields(model_size = model_bytes.len()))]
        pub fn from_bytes(
            model_bytes: &[u8],
            labels: Labels,
            config: &EngineConfig,
        ) -> Result<Self, EngineError> {
            let config = config.clone().validated();
            labels.validate(config.binary)?;

            let mut builder = Session::builder()?;
            builder = match config.device {
                Device::Gpu => builder
                    .with_execution_providers([CUDAExecutionProvider::default().build()])?,
                Device::Nnapi => builder
                    .with_execution_providers([NNAPIExecutionProvider::default().build()])?,
                Device::Cpu => builder,
            };
            let session = builder
                .with_intra_threads(config.thread_count)?
                .commit_from_memory(model_bytes)?;

            let (input_width, input_height) = Self::extract_input_size(&session)?;
            let (output_name, output_classes) = Self::extract_output_spec(&session)?;

            if config.binary {
                if output_classes > 2 {
                    return Err(EngineError::ConfigMismatch(format!(
                        "binary classifier flag set but model outputs {output_classes} classes"
                    )));
                }
            } else if output_classes != labels.len() {
                return Err(EngineError::ConfigMismatch(format!(
                    "model outputs {output_classes} classes but {} labels supplied",
                    labels.len()
                )));
            }

            debug!(
                input_size = %format!("{input_width}x{input_height}"),
                output_classes,
                binary = config.binary,
                "model loaded"
            );

            Ok(Self {
                session: Mutex::new(session),
                labels,
                input_width,
                input_height,
                output_name,
                output_classes,
                binary: config.binary,
            })
        }

        /// Loads the model file and newline-delimited label file.
        pub fn from_files(
            model_path: &Path,
            labels_path: &Path,
            config: &EngineConfig,
        ) -> Result<Self, EngineError> {
            let model_bytes = std::fs::read(model_path)?;
            let labels = Labels::parse(&std::fs::read_to_string(labels_path)?);
            Self::from_bytes(&model_bytes, labels, config)
        }

        /// Validates the input is the fused `[1, H, W, 4]` layout.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        fn extract_input_size(session: &Session) -> Result<(u32, u32), EngineError> {
            let input = session
                .inputs
                .first()
                .ok_or_else(|| EngineError::ConfigMismatch("model has no inputs".into()))?;

            let dims: Vec<i64> = input
                .input_type
                .tensor_dimensions()
                .ok_or_else(|| EngineError::ConfigMismatch("input is not a tensor".into()))?
                .collect();

            if dims.len() != 4 || dims[3] != 4 {
                return Err(EngineError::ConfigMismatch(format!(
                    "expected [1, H, W, 4] input, got {dims:?}"
                )));
            }

            let (height, width) = (dims[1], dims[2]);
            if !(1..=4096).contains(&height) || !(1..=4096).contains(&width) {
                return Err(EngineError::ConfigMismatch(format!(
                    "invalid input dimensions: {width}x{height}"
                )));
            }

            Ok((width as u32, height as u32))
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        fn extract_output_spec(session: &Session) -> Result<(String, usize), EngineError> {
            let output = session
                .outputs
                .first()
                .ok_or_else(|| EngineError::ConfigMismatch("model has no outputs".into()))?;

            let dims: Vec<i64> = output
                .output_type
                .tensor_dimensions()
                .ok_or_else(|| EngineError::ConfigMismatch("output is not a tensor".into()))?
                .collect();

            // [1, N] probability vector; a plain [N] head is also accepted.
            let classes = match dims.as_slice() {
                [n] | [1, n] if *n > 0 => *n,
                _ => {
                    return Err(EngineError::ConfigMismatch(format!(
                        "expected [1, N] output, got {dims:?}"
                    )))
                }
            };

            Ok((output.name.clone(), classes as usize))
        }
    }

    impl InferenceEngine for OrtEngine {
        fn input_size(&self) -> (u32, u32) {
            (self.input_width, self.input_height)
        }

        fn labels(&self) -> &Labels {
            &self.labels
        }

        fn run(&self, tensor: InputTensor) -> Result<ProbabilityVector, EngineError> {
            let input_value = ort::value::Value::from_array(tensor.into_inner())?;

            let session = self
                .session
                .lock()
                .map_err(|_| EngineError::Engine("session lock poisoned".into()))?;

            let outputs = session.run(ort::inputs![input_value])?;
            let output = outputs
                .get(self.output_name.as_str())
                .ok_or_else(|| EngineError::Engine("model missing output node".into()))?;

            let (shape, data) = output.try_extract_tensor::<f32>()?;

            let elements: i64 = shape.iter().product();
            let expected = i64::try_from(self.output_classes).unwrap_or(i64::MAX);
            if elements != expected {
                return Err(EngineError::InvalidOutputShape {
                    expected: format!("{} elements", self.output_classes),
                    got: format!("{shape:?}"),
                });
            }

            if self.binary {
                // One-element sigmoid head, or two-element softmax head with
                // the positive class at index 1.
                let p = if self.output_classes == 1 { data[0] } else { data[1] };
                Ok(ProbabilityVector::Binary(p))
            } else {
                Ok(ProbabilityVector::PerClass(data.to_vec()))
            }
        }
    }
}
