use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Frame;

#[derive(Debug, Error)]
pub enum AffineError {
    #[error("malformed transform definition at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("transform coefficient is not finite")]
    NonFinite,

    #[error("transform matrix is not invertible")]
    NotInvertible,

    #[error("invalid image dimensions: expected {expected_width}x{expected_height}, got {width}x{height}")]
    InvalidDimensions {
        expected_width: u32,
        expected_height: u32,
        width: u32,
        height: u32,
    },
}

/// A fixed 2D affine warp registering the visible sensor's view against the
/// thermal sensor's frame of reference.
///
/// The six coefficients are computed offline for images of exactly
/// `source_width x source_height`; applying the warp to any other size is a
/// precondition violation. The warp itself is implemented by inverse
/// mapping: every destination pixel is mapped back through the matrix and
/// bilinearly sampled from the source, with samples outside the source
/// filled with black. This restates the library defaults the calibration
/// was produced against (linear interpolation, constant zero border), so
/// the behavior is pinned rather than left to a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffineModel {
    matrix: [[f32; 3]; 2],
    inverse: [[f32; 3]; 2],
    source_width: u32,
    source_height: u32,
}

impl AffineModel {
    /// Builds a model from row-major coefficients `[a, b, c, d, e, f]`,
    /// mapping `(x, y)` to `(ax + by + c, dx + ey + f)`.
    pub fn new(
        coefficients: [f32; 6],
        source_width: u32,
        source_height: u32,
    ) -> Result<Self, AffineError> {
        if coefficients.iter().any(|c| !c.is_finite()) {
            return Err(AffineError::NonFinite);
        }

        let [a, b, c, d, e, f] = coefficients;
        let det = a * e - b * d;
        if det.abs() < f32::EPSILON {
            return Err(AffineError::NotInvertible);
        }

        let inverse = [
            [e / det, -b / det, (b * f - c * e) / det],
            [-d / det, a / det, (c * d - a * f) / det],
        ];

        Ok(Self {
            matrix: [[a, b, c], [d, e, f]],
            inverse,
            source_width,
            source_height,
        })
    }

    /// The identity transform for the given dimensions.
    pub fn identity(source_width: u32, source_height: u32) -> Self {
        Self::new([1.0, 0.0, 0.0, 0.0, 1.0, 0.0], source_width, source_height)
            .unwrap_or_else(|_| unreachable!("identity matrix is invertible"))
    }

    /// Parses the external transform definition: one `width,height` line
    /// followed by two lines of three comma-separated coefficients.
    pub fn parse(definition: &str) -> Result<Self, AffineError> {
        let mut lines = definition.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());

        let (line_no, dims) = lines.next().ok_or(AffineError::Parse {
            line: 1,
            reason: "missing dimensions line".into(),
        })?;
        let mut parts = dims.split(',').map(str::trim);
        let source_width = parse_field::<u32>(&mut parts, line_no + 1, "width")?;
        let source_height = parse_field::<u32>(&mut parts, line_no + 1, "height")?;

        let mut coefficients = [0.0f32; 6];
        for row in 0..2 {
            let (line_no, text) = lines.next().ok_or(AffineError::Parse {
                line: row + 2,
                reason: "missing matrix row".into(),
            })?;
            let mut parts = text.split(',').map(str::trim);
            for col in 0..3 {
                coefficients[row * 3 + col] =
                    parse_field::<f32>(&mut parts, line_no + 1, "coefficient")?;
            }
        }

        Self::new(coefficients, source_width, source_height)
    }

    #[must_use]
    pub fn coefficients(&self) -> [f32; 6] {
        let [[a, b, c], [d, e, f]] = self.matrix;
        [a, b, c, d, e, f]
    }

    #[must_use]
    pub fn source_width(&self) -> u32 {
        self.source_width
    }

    #[must_use]
    pub fn source_height(&self) -> u32 {
        self.source_height
    }

    /// Warps a frame. Output dimensions equal input dimensions; this is a
    /// geometric remap, not a resize.
    ///
    /// The input must already be scaled to `source_width x source_height`,
    /// otherwise `InvalidDimensions` is returned.
    pub fn apply(&self, frame: &Frame) -> Result<Frame, AffineError> {
        let (width, height) = frame.dimensions();
        if width != self.source_width || height != self.source_height {
            return Err(AffineError::InvalidDimensions {
                expected_width: self.source_width,
                expected_height: self.source_height,
                width,
                height,
            });
        }

        let src = frame.as_image();
        let mut dst = RgbImage::new(width, height);

        let [[ia, ib, ic], [id, ie, if_]] = self.inverse;
        for y in 0..height {
            for x in 0..width {
                #[allow(clippy::cast_precision_loss)]
                let (fx, fy) = (x as f32, y as f32);
                let sx = ia * fx + ib * fy + ic;
                let sy = id * fx + ie * fy + if_;
                dst.put_pixel(x, y, image::Rgb(sample_bilinear(src, sx, sy)));
            }
        }

        Ok(Frame::new(dst))
    }
}

/// Bilinear tap at fractional source coordinates; taps outside the source
/// contribute zero (constant black border).
fn sample_bilinear(src: &RgbImage, sx: f32, sy: f32) -> [u8; 3] {
    let x0 = sx.floor();
    let y0 = sy.floor();
    let tx = sx - x0;
    let ty = sy - y0;

    #[allow(clippy::cast_possible_truncation)]
    let (x0, y0) = (x0 as i64, y0 as i64);

    let tap = |x: i64, y: i64| -> [f32; 3] {
        if x < 0 || y < 0 || x >= i64::from(src.width()) || y >= i64::from(src.height()) {
            return [0.0; 3];
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let p = src.get_pixel(x as u32, y as u32).0;
        [f32::from(p[0]), f32::from(p[1]), f32::from(p[2])]
    };

    let p00 = tap(x0, y0);
    let p10 = tap(x0 + 1, y0);
    let p01 = tap(x0, y0 + 1);
    let p11 = tap(x0 + 1, y0 + 1);

    let mut out = [0u8; 3];
    for ch in 0..3 {
        let top = p00[ch] * (1.0 - tx) + p10[ch] * tx;
        let bottom = p01[ch] * (1.0 - tx) + p11[ch] * tx;
        let value = top * (1.0 - ty) + bottom * ty;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            out[ch] = value.round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

fn parse_field<T: std::str::FromStr>(
    parts: &mut dyn Iterator<Item = &str>,
    line: usize,
    what: &str,
) -> Result<T, AffineError> {
    parts
        .next()
        .ok_or_else(|| AffineError::Parse {
            line,
            reason: format!("missing {what}"),
        })?
        .parse::<T>()
        .map_err(|_| AffineError::Parse {
            line,
            reason: format!("invalid {what}"),
        })
}
