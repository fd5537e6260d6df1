//! Error taxonomy for the tiling core.
//!
//! Every variant is a fatal configuration or input error; the zero-weight
//! guard in the merger is handled numerically and never surfaces here.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TileError {
    #[error("patch size must be at least 1, got {0}")]
    InvalidPatchSize(usize),

    #[error("stride must be within 1..={patch_size}, got {stride}")]
    InvalidStride { stride: usize, patch_size: usize },

    #[error("weight epsilon must be finite and within (0, 1], got {0}")]
    InvalidEpsilon(f32),

    #[error("image must have non-zero height, width and channels, got {height}x{width}x{channels}")]
    EmptyImage {
        height: usize,
        width: usize,
        channels: usize,
    },

    #[error("pixel buffer holds {actual} bytes, expected {expected}")]
    BufferLength { expected: usize, actual: usize },

    #[error("patch size {patch_size} exceeds canvas {height}x{width}")]
    PatchExceedsCanvas {
        patch_size: usize,
        height: usize,
        width: usize,
    },

    #[error("no patches to merge")]
    NoPatches,

    #[error("got {patches} patches for {positions} positions")]
    CountMismatch { patches: usize, positions: usize },

    #[error("patch {index} has {actual} channels, expected {expected}")]
    ChannelMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("patch {index} has shape {actual:?}, expected {expected:?}")]
    PatchShapeMismatch {
        index: usize,
        expected: [usize; 2],
        actual: [usize; 2],
    },

    #[error("position ({y}, {x}) with patch size {patch_size} falls outside canvas {height}x{width}")]
    PositionOutOfBounds {
        y: usize,
        x: usize,
        patch_size: usize,
        height: usize,
        width: usize,
    },

    #[error("padding crop {crop_height}x{crop_width} at ({top}, {left}) does not fit image {height}x{width}")]
    PaddingOutOfBounds {
        top: usize,
        left: usize,
        crop_height: usize,
        crop_width: usize,
        height: usize,
        width: usize,
    },
}
