use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::affine::{AffineError, AffineModel};
use crate::FramePair;

#[derive(Debug, Error)]
pub enum TensorError {
    #[error("input frame has zero area")]
    EmptyFrame,

    #[error("invalid tensor dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error(transparent)]
    Affine(#[from] AffineError),
}

/// Channel value range fed to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Normalization {
    /// Raw 8-bit values, 0.0..=255.0.
    #[default]
    Raw,
    /// Values scaled into 0.0..=1.0.
    Unit,
}

impl Normalization {
    fn scale(self, value: f32) -> f32 {
        match self {
            Self::Raw => value,
            Self::Unit => value / 255.0,
        }
    }
}

/// Four-channel input tensor, shape `[1, height, width, 4]`, channel order
/// `[R, G, B, thermal_mean]`. Built fresh per inference call and owned
/// exclusively by that call.
#[derive(Debug)]
pub struct InputTensor(Array4<f32>);

impl InputTensor {
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }

    #[must_use]
    pub fn as_array(&self) -> &Array4<f32> {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> Array4<f32> {
        self.0
    }
}

/// Merges a frame pair into the model's input tensor.
///
/// Both frames are rescaled to the target size with bilinear interpolation
/// (`FilterType::Triangle`; fixed so model accuracy is reproducible across
/// builds), the visible frame is warped to the thermal frame of reference,
/// and the result is packed as three visible channels plus the mean of the
/// thermal pixel's channels, collapsing the thermal color map back to an
/// intensity proxy.
#[derive(Debug, Clone)]
pub struct TensorAssembler {
    target_width: u32,
    target_height: u32,
    normalization: Normalization,
}

impl TensorAssembler {
    pub fn new(
        target_width: u32,
        target_height: u32,
        normalization: Normalization,
    ) -> Result<Self, TensorError> {
        if target_width == 0 || target_height == 0 {
            return Err(TensorError::InvalidDimensions {
                width: target_width,
                height: target_height,
            });
        }
        Ok(Self {
            target_width,
            target_height,
            normalization,
        })
    }

    #[must_use]
    pub fn target_size(&self) -> (u32, u32) {
        (self.target_width, self.target_height)
    }

    /// Builds the `[1, H, W, 4]` tensor for one frame pair.
    ///
    /// Fails with `EmptyFrame` if either input has zero area, before any
    /// allocation; affine dimension mismatches propagate from the warp.
    pub fn build(
        &self,
        pair: &FramePair,
        affine: &AffineModel,
    ) -> Result<InputTensor, TensorError> {
        if pair.thermal.is_empty() || pair.visible.is_empty() {
            return Err(TensorError::EmptyFrame);
        }

        let thermal = self.rescale(pair.thermal.as_image());
        let visible = self.rescale(pair.visible.as_image());

        // Parallax correction happens after the rescale: the warp is
        // defined for images at the model's input size.
        let visible = affine.apply(&crate::Frame::new(visible))?;
        let visible = visible.as_image();

        let (width, height) = (self.target_width as usize, self.target_height as usize);
        let mut tensor = Array4::<f32>::zeros((1, height, width, 4));

        for y in 0..height {
            for x in 0..width {
                #[allow(clippy::cast_possible_truncation)]
                let (px, py) = (x as u32, y as u32);
                let rgb = visible.get_pixel(px, py).0;
                let fir = thermal.get_pixel(px, py).0;

                tensor[[0, y, x, 0]] = self.normalization.scale(f32::from(rgb[0]));
                tensor[[0, y, x, 1]] = self.normalization.scale(f32::from(rgb[1]));
                tensor[[0, y, x, 2]] = self.normalization.scale(f32::from(rgb[2]));

                let mean =
                    (f32::from(fir[0]) + f32::from(fir[1]) + f32::from(fir[2])) / 3.0;
                tensor[[0, y, x, 3]] = self.normalization.scale(mean);
            }
        }

        Ok(InputTensor(tensor))
    }

    fn rescale(&self, image: &RgbImage) -> RgbImage {
        if image.dimensions() == (self.target_width, self.target_height) {
            return image.clone();
        }
        imageops::resize(
            image,
            self.target_width,
            self.target_height,
            FilterType::Triangle,
        )
    }
}
