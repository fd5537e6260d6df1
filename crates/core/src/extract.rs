//! Patch extraction over a padded canvas.
//!
//! Origins advance by `stride` along each axis; when the stride does not land
//! exactly on the far edge, one more edge-aligned origin is appended so the
//! last row and column of pixels are always covered.

use ndarray::{s, Array3};

use crate::error::TileError;
use crate::types::{validate_patch_and_stride, Image, Position, TileGrid};

/// Patch origins along one axis of length `dimension`.
///
/// Origins are strictly increasing; the forced edge origin is only added
/// when it is strictly past the last stride origin, so it never duplicates one.
pub fn axis_origins(
    dimension: usize,
    patch_size: usize,
    stride: usize,
) -> Result<Vec<usize>, TileError> {
    validate_patch_and_stride(patch_size, stride)?;
    if patch_size > dimension {
        return Err(TileError::PatchExceedsCanvas {
            patch_size,
            height: dimension,
            width: dimension,
        });
    }

    let last_origin = dimension - patch_size;
    let mut origins: Vec<usize> = (0..=last_origin).step_by(stride).collect();
    if let Some(&last) = origins.last() {
        if last + patch_size < dimension {
            origins.push(last_origin);
        }
    }
    Ok(origins)
}

/// Plan every patch origin for a `height` x `width` canvas.
pub fn plan_grid(
    height: usize,
    width: usize,
    patch_size: usize,
    stride: usize,
) -> Result<TileGrid, TileError> {
    validate_patch_and_stride(patch_size, stride)?;
    if patch_size > height || patch_size > width {
        return Err(TileError::PatchExceedsCanvas {
            patch_size,
            height,
            width,
        });
    }

    Ok(TileGrid {
        height,
        width,
        patch_size,
        stride,
        y_origins: axis_origins(height, patch_size, stride)?,
        x_origins: axis_origins(width, patch_size, stride)?,
    })
}

/// Copy out every `patch_size` square of `image`, in row-major position order.
///
/// Patches are owned copies; the returned positions line up 1:1 with them.
pub fn extract(
    image: &Image,
    patch_size: usize,
    stride: usize,
) -> Result<(Vec<Array3<u8>>, Vec<Position>), TileError> {
    let grid = plan_grid(image.height(), image.width(), patch_size, stride)?;
    let positions: Vec<Position> = grid.positions().collect();
    let patches = extract_at(image, &positions, patch_size)?;
    Ok((patches, positions))
}

/// Copy out the patches at the given positions.
pub fn extract_at(
    image: &Image,
    positions: &[Position],
    patch_size: usize,
) -> Result<Vec<Array3<u8>>, TileError> {
    let view = image.view();
    positions
        .iter()
        .map(|pos| {
            if pos.y + patch_size > image.height() || pos.x + patch_size > image.width() {
                return Err(TileError::PositionOutOfBounds {
                    y: pos.y,
                    x: pos.x,
                    patch_size,
                    height: image.height(),
                    width: image.width(),
                });
            }
            Ok(view
                .slice(s![pos.y..pos.y + patch_size, pos.x..pos.x + patch_size, ..])
                .to_owned())
        })
        .collect()
}
