#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod affine;
pub mod buffer;
pub mod camera;
pub mod engine;
pub mod pipeline;
pub mod ranker;
pub mod scheduler;
pub mod tensor;
pub mod writer;

use std::sync::Arc;

use image::RgbImage;

pub use affine::{AffineError, AffineModel};
pub use buffer::{BufferError, FrameBuffer, OverflowPolicy};
pub use camera::{
    CameraError, CameraEvent, ConnectionStatus, DeviceIdentity, DiscoveryEvent, FrameSource,
};
pub use engine::{Device, EngineConfig, EngineError, InferenceEngine, Labels, ProbabilityVector};
#[cfg(feature = "ml")]
pub use engine::OrtEngine;
pub use pipeline::{FusionPipeline, PipelineConfig, PipelineError, ResultSink};
pub use ranker::Recognition;
pub use scheduler::{FrameScheduler, LatencyWindow};
pub use tensor::{InputTensor, Normalization, TensorAssembler, TensorError};
pub use writer::{ImageWriter, WriterError};

/// Default capacity of the display frame buffer.
pub const FRAME_BUFFER_CAPACITY: usize = 21;

/// Default number of recognitions reported per processed frame.
pub const MAX_RESULTS: usize = 3;

/// Number of latency samples between scheduler summary reports.
pub const LATENCY_WINDOW: usize = 20;

/// One sensor's raster, immutable once captured.
///
/// Both streams arrive as RGB8 at this boundary: the camera fusion layer
/// color-maps the thermal signal before handing it over. Frames are shared
/// behind an `Arc` so a clone is O(1) and a pair can sit in the display
/// buffer and the inference queue at the same time without copying pixels.
#[derive(Debug, Clone)]
pub struct Frame {
    image: Arc<RgbImage>,
}

impl Frame {
    #[must_use]
    pub fn new(image: RgbImage) -> Self {
        Self {
            image: Arc::new(image),
        }
    }

    /// Builds a frame from a raw interleaved RGB8 buffer.
    ///
    /// Returns `None` if the buffer length does not match `width * height * 3`.
    #[must_use]
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        RgbImage::from_raw(width, height, data).map(Self::new)
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }

    #[must_use]
    pub fn as_image(&self) -> &RgbImage {
        &self.image
    }
}

impl From<RgbImage> for Frame {
    fn from(image: RgbImage) -> Self {
        Self::new(image)
    }
}

/// One thermal frame and one visible frame from the same camera callback.
///
/// Pairing is positional: the camera delivers exactly one of each per
/// callback and no timestamp reconciliation is performed beyond delivery
/// order. `sequence` is stamped by the pipeline at admission and increases
/// monotonically per stream.
#[derive(Debug, Clone)]
pub struct FramePair {
    pub thermal: Frame,
    pub visible: Frame,
    pub sequence: u64,
}

impl FramePair {
    #[must_use]
    pub fn new(thermal: Frame, visible: Frame, sequence: u64) -> Self {
        Self {
            thermal,
            visible,
            sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_from_raw_checks_length() {
        assert!(Frame::from_raw(2, 2, vec![0u8; 12]).is_some());
        assert!(Frame::from_raw(2, 2, vec![0u8; 11]).is_none());
    }

    #[test]
    fn frame_clone_shares_pixels() {
        let frame = Frame::new(RgbImage::new(4, 4));
        let clone = frame.clone();
        assert!(Arc::ptr_eq(&frame.image, &clone.image));
    }

    #[test]
    fn empty_frame_detected() {
        let frame = Frame::new(RgbImage::new(0, 0));
        assert!(frame.is_empty());
        let frame = Frame::new(RgbImage::new(1, 1));
        assert!(!frame.is_empty());
    }
}
