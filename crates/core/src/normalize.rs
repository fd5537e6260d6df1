//! Linear mapping between 8-bit pixel values and a model's value range.

use ndarray::{Array3, Array4, ArrayView4, Axis};
use serde::{Deserialize, Serialize};

use crate::error::TileError;

/// Closed interval `[min, max]` of sample values a model consumes or produces.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 2]", into = "[f32; 2]")]
pub struct ValueRange {
    pub min: f32,
    pub max: f32,
}

impl ValueRange {
    pub const PIXEL: ValueRange = ValueRange {
        min: 0.0,
        max: 255.0,
    };
    pub const SIGNED_UNIT: ValueRange = ValueRange {
        min: -1.0,
        max: 1.0,
    };
    pub const UNIT: ValueRange = ValueRange { min: 0.0, max: 1.0 };

    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    pub fn span(&self) -> f32 {
        self.max - self.min
    }

    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.max > self.min
    }

    /// Map a pixel value in `[0, 255]` into this range.
    #[inline]
    pub fn from_pixel(&self, value: f32) -> f32 {
        value / 255.0 * self.span() + self.min
    }

    /// Map a value in this range back to `[0, 255]`, unclamped.
    #[inline]
    pub fn to_pixel(&self, value: f32) -> f32 {
        (value - self.min) / self.span() * 255.0
    }
}

impl Default for ValueRange {
    fn default() -> Self {
        Self::SIGNED_UNIT
    }
}

impl From<[f32; 2]> for ValueRange {
    fn from([min, max]: [f32; 2]) -> Self {
        Self { min, max }
    }
}

impl From<ValueRange> for [f32; 2] {
    fn from(range: ValueRange) -> Self {
        [range.min, range.max]
    }
}

/// Stack 8-bit HWC patches into an NHWC batch scaled into `range`.
///
/// Every patch must match the first one's shape exactly.
pub fn normalize_patches(
    patches: &[Array3<u8>],
    range: ValueRange,
) -> Result<Array4<f32>, TileError> {
    let Some(first) = patches.first() else {
        return Ok(Array4::zeros((0, 0, 0, 0)));
    };
    let (height, width, channels) = first.dim();
    for (index, patch) in patches.iter().enumerate().skip(1) {
        let (h, w, c) = patch.dim();
        if (h, w) != (height, width) {
            return Err(TileError::PatchShapeMismatch {
                index,
                expected: [height, width],
                actual: [h, w],
            });
        }
        if c != channels {
            return Err(TileError::ChannelMismatch {
                index,
                expected: channels,
                actual: c,
            });
        }
    }

    let mut batch = Array4::<f32>::zeros((patches.len(), height, width, channels));
    for (mut slot, patch) in batch.axis_iter_mut(Axis(0)).zip(patches) {
        slot.zip_mut_with(patch, |dst, &src| *dst = range.from_pixel(f32::from(src)));
    }
    Ok(batch)
}

/// Map a model output batch from `range` back to pixel scale.
///
/// Values are left unclamped and unquantized; the merger clamps once after blending.
pub fn denormalize(batch: ArrayView4<'_, f32>, range: ValueRange) -> Array4<f32> {
    batch.mapv(|v| range.to_pixel(v))
}

/// Split an NHWC batch into owned per-patch HWC arrays.
pub fn split_batch(batch: Array4<f32>) -> Vec<Array3<f32>> {
    batch
        .axis_iter(Axis(0))
        .map(|patch| patch.to_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_unit_mapping_matches_pixel_scale() {
        let range = ValueRange::SIGNED_UNIT;
        assert_eq!(range.from_pixel(0.0), -1.0);
        assert_eq!(range.from_pixel(255.0), 1.0);
        assert!((range.from_pixel(127.5)).abs() < 1e-6);
        assert_eq!(range.to_pixel(-1.0), 0.0);
        assert_eq!(range.to_pixel(1.0), 255.0);
    }

    #[test]
    fn test_normalize_patches_shapes_batch() {
        let patches = vec![
            Array3::<u8>::from_elem((4, 4, 3), 0),
            Array3::<u8>::from_elem((4, 4, 3), 255),
        ];
        let batch = normalize_patches(&patches, ValueRange::SIGNED_UNIT).unwrap();
        assert_eq!(batch.dim(), (2, 4, 4, 3));
        assert!(batch.index_axis(Axis(0), 0).iter().all(|&v| v == -1.0));
        assert!(batch.index_axis(Axis(0), 1).iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_normalize_rejects_mixed_channel_counts() {
        // A single channel would broadcast silently; two would not broadcast at all.
        for bad_channels in [1, 2] {
            let patches = vec![
                Array3::<u8>::zeros((4, 4, 3)),
                Array3::<u8>::from_elem((4, 4, bad_channels), 255),
            ];
            assert_eq!(
                normalize_patches(&patches, ValueRange::SIGNED_UNIT),
                Err(TileError::ChannelMismatch {
                    index: 1,
                    expected: 3,
                    actual: bad_channels,
                })
            );
        }
    }

    #[test]
    fn test_normalize_rejects_mixed_patch_sizes() {
        let patches = vec![
            Array3::<u8>::zeros((4, 4, 3)),
            Array3::<u8>::zeros((4, 4, 3)),
            Array3::<u8>::zeros((4, 1, 3)),
        ];
        assert_eq!(
            normalize_patches(&patches, ValueRange::UNIT),
            Err(TileError::PatchShapeMismatch {
                index: 2,
                expected: [4, 4],
                actual: [4, 1],
            })
        );
    }

    #[test]
    fn test_normalize_empty_batch() {
        let batch = normalize_patches(&[], ValueRange::UNIT).unwrap();
        assert_eq!(batch.len_of(Axis(0)), 0);
    }

    #[test]
    fn test_denormalize_round_trips_every_pixel_value() {
        for range in [
            ValueRange::SIGNED_UNIT,
            ValueRange::UNIT,
            ValueRange::PIXEL,
            ValueRange::new(-3.5, 12.0),
        ] {
            let values: Vec<u8> = (0..=255).collect();
            let patch = Array3::from_shape_vec((16, 16, 1), values).unwrap();
            let batch = normalize_patches(std::slice::from_ref(&patch), range).unwrap();
            let restored = denormalize(batch.view(), range);
            for (&orig, &back) in patch.iter().zip(restored.iter()) {
                assert!(
                    (f32::from(orig) - back).abs() < 1e-3,
                    "{range:?}: {orig} -> {back}"
                );
            }
        }
    }

    #[test]
    fn test_denormalize_does_not_clamp() {
        let batch = Array4::from_elem((1, 1, 1, 1), 2.0);
        let out = denormalize(batch.view(), ValueRange::SIGNED_UNIT);
        assert!((out[[0, 0, 0, 0]] - 382.5).abs() < 1e-4);
    }

    #[test]
    fn test_split_batch_preserves_order() {
        let mut batch = Array4::<f32>::zeros((3, 2, 2, 1));
        for (i, mut patch) in batch.axis_iter_mut(Axis(0)).enumerate() {
            patch.fill(i as f32);
        }
        let patches = split_batch(batch);
        assert_eq!(patches.len(), 3);
        assert_eq!(patches[2][[1, 1, 0]], 2.0);
    }

    #[test]
    fn test_value_range_validity_and_serde_shape() {
        assert!(ValueRange::default().is_valid());
        assert!(!ValueRange::new(1.0, 1.0).is_valid());
        assert!(!ValueRange::new(0.0, f32::NAN).is_valid());

        let json = serde_json::to_string(&ValueRange::SIGNED_UNIT).unwrap();
        assert_eq!(json, "[-1.0,1.0]");
        let parsed: ValueRange = serde_json::from_str("[0.0, 255.0]").unwrap();
        assert_eq!(parsed, ValueRange::PIXEL);
    }
}
