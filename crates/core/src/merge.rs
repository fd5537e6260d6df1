//! Weighted reassembly of per-patch outputs onto the padded canvas.
//!
//! Each patch is multiplied by the shared [`WeightMap`] and added into an
//! output accumulator while the weights themselves are added into a weight
//! accumulator; the final image is their ratio, clamped to `0..=255`.

use std::thread;

use ndarray::{s, Array3, ArrayView3, ArrayViewMut3, Axis, Zip};
use tracing::debug;

use crate::error::TileError;
use crate::types::{Image, Position};
use crate::weight::WeightMap;

/// Floor applied to accumulated weight before dividing.
pub const MIN_WEIGHT_TOTAL: f32 = 1e-6;

/// Output and weight-total buffers for a single merge.
#[derive(Debug)]
pub struct MergeAccumulator {
    output: Array3<f32>,
    weight_total: Array3<f32>,
}

impl MergeAccumulator {
    pub fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            output: Array3::zeros((height, width, channels)),
            weight_total: Array3::zeros((height, width, 1)),
        }
    }

    pub fn height(&self) -> usize {
        self.output.dim().0
    }

    pub fn width(&self) -> usize {
        self.output.dim().1
    }

    pub fn channels(&self) -> usize {
        self.output.dim().2
    }

    /// Add one weighted patch at `position`.
    pub fn accumulate<T>(
        &mut self,
        patch: ArrayView3<'_, T>,
        position: Position,
        weights: &WeightMap,
    ) -> Result<(), TileError>
    where
        T: Copy + Into<f32>,
    {
        check_patch(0, &patch, self.channels(), weights.patch_size())?;
        check_position(position, weights.patch_size(), self.height(), self.width())?;
        accumulate_rows(
            self.output.view_mut(),
            self.weight_total.view_mut(),
            0,
            patch,
            position,
            weights.view(),
        );
        Ok(())
    }

    /// Smallest accumulated weight anywhere on the canvas.
    pub fn min_weight(&self) -> f32 {
        self.weight_total
            .iter()
            .copied()
            .fold(f32::INFINITY, f32::min)
    }

    /// Normalize by accumulated weight and quantize to 8 bits.
    pub fn finish(mut self) -> Result<Image, TileError> {
        Zip::from(&mut self.output)
            .and_broadcast(&self.weight_total)
            .for_each(|value, &weight| *value /= weight.max(MIN_WEIGHT_TOTAL));
        let pixels = self.output.mapv(|v| v.round().clamp(0.0, 255.0) as u8);
        Image::from_array(pixels)
    }
}

/// Blend `patches` placed at `positions` into a `height` x `width` image.
///
/// Accumulation runs in the supplied order on the calling thread.
pub fn merge<T>(
    patches: &[Array3<T>],
    positions: &[Position],
    height: usize,
    width: usize,
    weights: &WeightMap,
) -> Result<Image, TileError>
where
    T: Copy + Into<f32>,
{
    let channels = validate(patches, positions, height, width, weights.patch_size())?;
    let mut acc = MergeAccumulator::new(height, width, channels);
    for (patch, &position) in patches.iter().zip(positions) {
        accumulate_rows(
            acc.output.view_mut(),
            acc.weight_total.view_mut(),
            0,
            patch.view(),
            position,
            weights.view(),
        );
    }
    acc.finish()
}

/// Same result as [`merge`], with the canvas split into `threads` disjoint
/// horizontal bands that accumulate concurrently.
///
/// Every band visits patches in the supplied order, so each pixel sums its
/// contributions in the same sequence as the sequential merge.
pub fn merge_banded<T>(
    patches: &[Array3<T>],
    positions: &[Position],
    height: usize,
    width: usize,
    weights: &WeightMap,
    threads: usize,
) -> Result<Image, TileError>
where
    T: Copy + Into<f32> + Sync,
{
    let channels = validate(patches, positions, height, width, weights.patch_size())?;
    let threads = threads.clamp(1, height);
    if threads == 1 {
        return merge(patches, positions, height, width, weights);
    }

    let band_height = height.div_ceil(threads);
    debug!(threads, band_height, "Merging patches in row bands");

    let mut acc = MergeAccumulator::new(height, width, channels);
    let weight_view = weights.view();
    thread::scope(|scope| {
        let bands = acc
            .output
            .axis_chunks_iter_mut(Axis(0), band_height)
            .zip(acc.weight_total.axis_chunks_iter_mut(Axis(0), band_height))
            .enumerate();
        for (index, (output_band, weight_band)) in bands {
            let row_offset = index * band_height;
            scope.spawn(move || {
                let mut output_band = output_band;
                let mut weight_band = weight_band;
                for (patch, &position) in patches.iter().zip(positions) {
                    accumulate_rows(
                        output_band.view_mut(),
                        weight_band.view_mut(),
                        row_offset,
                        patch.view(),
                        position,
                        weight_view,
                    );
                }
            });
        }
    });
    acc.finish()
}

/// Accumulate the part of a patch that falls inside a band of canvas rows
/// starting at `row_offset`. Bounds are checked by the caller.
fn accumulate_rows<T>(
    mut output: ArrayViewMut3<'_, f32>,
    mut weight_total: ArrayViewMut3<'_, f32>,
    row_offset: usize,
    patch: ArrayView3<'_, T>,
    position: Position,
    weights: ArrayView3<'_, f32>,
) where
    T: Copy + Into<f32>,
{
    let patch_size = weights.dim().0;
    let band_end = row_offset + output.dim().0;
    let top = position.y.max(row_offset);
    let bottom = (position.y + patch_size).min(band_end);
    if top >= bottom {
        return;
    }

    let rows = top - row_offset..bottom - row_offset;
    let cols = position.x..position.x + patch_size;
    let patch_rows = patch.slice(s![top - position.y..bottom - position.y, .., ..]);
    let weight_rows = weights.slice(s![top - position.y..bottom - position.y, .., ..]);

    Zip::from(output.slice_mut(s![rows.clone(), cols.clone(), ..]))
        .and(&patch_rows)
        .and_broadcast(&weight_rows)
        .for_each(|acc, &value, &weight| *acc += value.into() * weight);
    let mut weight_window = weight_total.slice_mut(s![rows, cols, ..]);
    weight_window += &weight_rows;
}

fn validate<T>(
    patches: &[Array3<T>],
    positions: &[Position],
    height: usize,
    width: usize,
    patch_size: usize,
) -> Result<usize, TileError> {
    if patches.len() != positions.len() {
        return Err(TileError::CountMismatch {
            patches: patches.len(),
            positions: positions.len(),
        });
    }
    let Some(first) = patches.first() else {
        return Err(TileError::NoPatches);
    };
    if height == 0 || width == 0 {
        return Err(TileError::EmptyImage {
            height,
            width,
            channels: first.dim().2,
        });
    }

    let channels = first.dim().2;
    for (index, (patch, &position)) in patches.iter().zip(positions).enumerate() {
        check_patch(index, &patch.view(), channels, patch_size)?;
        check_position(position, patch_size, height, width)?;
    }
    Ok(channels)
}

fn check_patch<T>(
    index: usize,
    patch: &ArrayView3<'_, T>,
    channels: usize,
    patch_size: usize,
) -> Result<(), TileError> {
    let (h, w, c) = patch.dim();
    if h != patch_size || w != patch_size {
        return Err(TileError::PatchShapeMismatch {
            index,
            expected: [patch_size, patch_size],
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
    Ok(())
}

fn check_position(
    position: Position,
    patch_size: usize,
    height: usize,
    width: usize,
) -> Result<(), TileError> {
    if position.y + patch_size > height || position.x + patch_size > width {
        return Err(TileError::PositionOutOfBounds {
            y: position.y,
            x: position.x,
            patch_size,
            height,
            width,
        });
    }
    Ok(())
}
