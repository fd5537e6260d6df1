use ndarray::{Array3, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::error::TileError;

pub const DEFAULT_PATCH_SIZE: usize = 224;
pub const DEFAULT_WEIGHT_EPSILON: f32 = 0.05;

/// Owned HWC pixel buffer with 8-bit samples.
///
/// Height, width and channel count are all at least 1; every constructor
/// enforces this so downstream stages never see a degenerate image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pixels: Array3<u8>,
}

impl Image {
    pub fn from_array(pixels: Array3<u8>) -> Result<Self, TileError> {
        let (height, width, channels) = pixels.dim();
        if height == 0 || width == 0 || channels == 0 {
            return Err(TileError::EmptyImage {
                height,
                width,
                channels,
            });
        }
        Ok(Self { pixels })
    }

    /// Build from interleaved row-major bytes (`height * width * channels`).
    pub fn from_raw(
        height: usize,
        width: usize,
        channels: usize,
        data: Vec<u8>,
    ) -> Result<Self, TileError> {
        if height == 0 || width == 0 || channels == 0 {
            return Err(TileError::EmptyImage {
                height,
                width,
                channels,
            });
        }
        let expected = height
            .checked_mul(width)
            .and_then(|n| n.checked_mul(channels))
            .ok_or(TileError::BufferLength {
                expected: usize::MAX,
                actual: data.len(),
            })?;
        if data.len() != expected {
            return Err(TileError::BufferLength {
                expected,
                actual: data.len(),
            });
        }
        let actual = data.len();
        let pixels = Array3::from_shape_vec((height, width, channels), data)
            .map_err(|_| TileError::BufferLength { expected, actual })?;
        Ok(Self { pixels })
    }

    pub fn filled(height: usize, width: usize, channels: usize, value: u8) -> Result<Self, TileError> {
        Self::from_array(Array3::from_elem((height, width, channels), value))
    }

    pub fn height(&self) -> usize {
        self.pixels.dim().0
    }

    pub fn width(&self) -> usize {
        self.pixels.dim().1
    }

    pub fn channels(&self) -> usize {
        self.pixels.dim().2
    }

    pub fn view(&self) -> ArrayView3<'_, u8> {
        self.pixels.view()
    }

    pub fn into_array(self) -> Array3<u8> {
        self.pixels
    }

    /// Interleaved bytes in row-major HWC order.
    pub fn as_raw(&self) -> Vec<u8> {
        self.pixels.iter().copied().collect()
    }
}

/// Top-left corner of a patch within the padded canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub y: usize,
    pub x: usize,
}

impl Position {
    pub fn new(y: usize, x: usize) -> Self {
        Self { y, x }
    }
}

/// Offsets and original dimensions needed to undo [`crate::pad::pad`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaddingSpec {
    pub top: usize,
    pub left: usize,
    pub original_height: usize,
    pub original_width: usize,
}

/// Patch origins along both axes of a canvas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TileGrid {
    pub height: usize,
    pub width: usize,
    pub patch_size: usize,
    pub stride: usize,
    pub y_origins: Vec<usize>,
    pub x_origins: Vec<usize>,
}

impl TileGrid {
    pub fn len(&self) -> usize {
        self.y_origins.len() * self.x_origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row-major: every x for a given y before advancing y.
    pub fn positions(&self) -> impl Iterator<Item = Position> + '_ {
        self.y_origins
            .iter()
            .flat_map(move |&y| self.x_origins.iter().map(move |&x| Position::new(y, x)))
    }
}

/// Caller-supplied tiling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TileParams {
    pub patch_size: usize,
    pub stride: usize,
    pub epsilon: f32,
}

impl TileParams {
    /// Half-overlap stride and the default weight floor.
    pub fn new(patch_size: usize) -> Self {
        Self {
            patch_size,
            stride: default_stride(patch_size),
            epsilon: DEFAULT_WEIGHT_EPSILON,
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn validate(&self) -> Result<(), TileError> {
        validate_patch_and_stride(self.patch_size, self.stride)?;
        validate_epsilon(self.epsilon)
    }
}

impl Default for TileParams {
    fn default() -> Self {
        Self::new(DEFAULT_PATCH_SIZE)
    }
}

pub fn default_stride(patch_size: usize) -> usize {
    (patch_size / 2).max(1)
}

pub(crate) fn validate_patch_and_stride(patch_size: usize, stride: usize) -> Result<(), TileError> {
    if patch_size == 0 {
        return Err(TileError::InvalidPatchSize(patch_size));
    }
    if stride == 0 || stride > patch_size {
        return Err(TileError::InvalidStride { stride, patch_size });
    }
    Ok(())
}

pub(crate) fn validate_epsilon(epsilon: f32) -> Result<(), TileError> {
    if !epsilon.is_finite() || epsilon <= 0.0 || epsilon > 1.0 {
        return Err(TileError::InvalidEpsilon(epsilon));
    }
    Ok(())
}
