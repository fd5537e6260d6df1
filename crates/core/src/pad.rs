//! Canvas padding: grow an image to a square, patch-aligned canvas using
//! mirrored edge pixels, and crop it back afterwards.

use ndarray::{s, Array3};

use crate::error::TileError;
use crate::types::{Image, PaddingSpec};

/// Side of the square canvas for an image of `height` x `width`.
pub fn canvas_side(height: usize, width: usize, patch_size: usize) -> Result<usize, TileError> {
    if patch_size == 0 {
        return Err(TileError::InvalidPatchSize(patch_size));
    }
    Ok(height.max(width).div_ceil(patch_size) * patch_size)
}

/// Padding that centers a `height` x `width` image on its canvas.
///
/// The odd leftover pixel on each axis goes to the bottom/right.
pub fn plan_padding(
    height: usize,
    width: usize,
    patch_size: usize,
) -> Result<(usize, PaddingSpec), TileError> {
    if height == 0 || width == 0 {
        return Err(TileError::EmptyImage {
            height,
            width,
            channels: 0,
        });
    }
    let side = canvas_side(height, width, patch_size)?;
    let spec = PaddingSpec {
        top: (side - height) / 2,
        left: (side - width) / 2,
        original_height: height,
        original_width: width,
    };
    Ok((side, spec))
}

/// Pad `image` to a centered `side x side` canvas, `side` a multiple of `patch_size`.
pub fn pad(image: &Image, patch_size: usize) -> Result<(Image, PaddingSpec), TileError> {
    let (height, width, channels) = (image.height(), image.width(), image.channels());
    let (side, spec) = plan_padding(height, width, patch_size)?;
    let (top, left) = (spec.top, spec.left);

    let src = image.view();
    let mut padded = Array3::<u8>::zeros((side, side, channels));
    for y in 0..side {
        let src_y = reflect_index(y as isize - top as isize, height);
        for x in 0..side {
            let src_x = reflect_index(x as isize - left as isize, width);
            padded
                .slice_mut(s![y, x, ..])
                .assign(&src.slice(s![src_y, src_x, ..]));
        }
    }

    Ok((Image::from_array(padded)?, spec))
}

/// Crop the region described by `spec` out of a padded canvas.
pub fn unpad(image: &Image, spec: &PaddingSpec) -> Result<Image, TileError> {
    let bottom = spec.top + spec.original_height;
    let right = spec.left + spec.original_width;
    if bottom > image.height() || right > image.width() {
        return Err(TileError::PaddingOutOfBounds {
            top: spec.top,
            left: spec.left,
            crop_height: spec.original_height,
            crop_width: spec.original_width,
            height: image.height(),
            width: image.width(),
        });
    }

    let cropped = image
        .view()
        .slice(s![spec.top..bottom, spec.left..right, ..])
        .to_owned();
    Image::from_array(cropped)
}

/// Map an out-of-range coordinate back into `0..len` by mirroring about the
/// edge samples (the edge itself is not repeated). Distances beyond one
/// image length keep bouncing between both edges.
fn reflect_index(index: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len as isize - 1);
    let folded = index.rem_euclid(period);
    if folded < len as isize {
        folded as usize
    } else {
        (period - folded) as usize
    }
}
