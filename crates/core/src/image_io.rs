//! Decoding and encoding image files through the `image` crate.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

use anyhow::{bail, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use tracing::debug;

use crate::types::Image;

pub const DEFAULT_JPEG_QUALITY: u8 = 95;

/// Decode `path` into an RGB image.
pub fn load_image(path: &Path) -> Result<Image> {
    let decoded = image::open(path)
        .with_context(|| format!("failed to decode image: {}", path.display()))?;
    debug!(
        path = %path.display(),
        width = decoded.width(),
        height = decoded.height(),
        color = ?decoded.color(),
        "Loaded image"
    );
    from_dynamic(decoded)
}

/// Height and width of an image file, read from its header only.
pub fn image_dimensions(path: &Path) -> Result<(usize, usize)> {
    let (width, height) = image::image_dimensions(path)
        .with_context(|| format!("failed to read image header: {}", path.display()))?;
    Ok((height as usize, width as usize))
}

pub fn from_dynamic(decoded: DynamicImage) -> Result<Image> {
    let rgb = decoded.into_rgb8();
    let (width, height) = rgb.dimensions();
    Ok(Image::from_raw(
        height as usize,
        width as usize,
        3,
        rgb.into_raw(),
    )?)
}

/// Wrap an [`Image`] as a `DynamicImage`. Supports 1, 3 and 4 channels.
pub fn to_dynamic(image: &Image) -> Result<DynamicImage> {
    let width = u32::try_from(image.width()).context("image width exceeds u32")?;
    let height = u32::try_from(image.height()).context("image height exceeds u32")?;
    let raw = image.as_raw();

    let dynamic = match image.channels() {
        1 => GrayImage::from_raw(width, height, raw).map(DynamicImage::ImageLuma8),
        3 => RgbImage::from_raw(width, height, raw).map(DynamicImage::ImageRgb8),
        4 => RgbaImage::from_raw(width, height, raw).map(DynamicImage::ImageRgba8),
        other => bail!("cannot encode an image with {other} channels"),
    };
    dynamic.context("pixel buffer does not match image dimensions")
}

/// Encode `image` to `path`, format chosen by extension (PNG when unknown).
///
/// `jpeg_quality` (1-100) applies to `.jpg`/`.jpeg`; alpha is dropped for JPEG.
pub fn save_image(image: &Image, path: &Path, jpeg_quality: u8) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory: {}", parent.display()))?;
    }

    let dynamic = to_dynamic(image)?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("png")
        .to_ascii_lowercase();

    match extension.as_str() {
        "jpg" | "jpeg" => {
            let dynamic = if image.channels() == 4 {
                DynamicImage::ImageRgb8(dynamic.into_rgb8())
            } else {
                dynamic
            };
            let file = File::create(path)
                .with_context(|| format!("failed to create image file: {}", path.display()))?;
            let encoder =
                JpegEncoder::new_with_quality(BufWriter::new(file), jpeg_quality.clamp(1, 100));
            dynamic
                .write_with_encoder(encoder)
                .with_context(|| format!("failed to encode JPEG: {}", path.display()))?;
        }
        _ => {
            dynamic
                .save(path)
                .with_context(|| format!("failed to save image: {}", path.display()))?;
        }
    }

    debug!(path = %path.display(), "Saved image");
    Ok(())
}
