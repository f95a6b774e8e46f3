//! Image loading and preprocessing.

use std::path::Path;

use image::{imageops::FilterType, DynamicImage, GenericImageView, Rgb, RgbImage};
use ndarray::Array4;

use crate::config::PreprocessConfig;
use crate::error::{Error, Result};

use super::{ImageTensor, RGB_CHANNELS};

/// Decode an image file of any supported container format.
///
/// # Errors
///
/// Returns [`Error::ImageLoad`] naming `path` if the file cannot be decoded.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<DynamicImage> {
    let path = path.as_ref();

    image::open(path).map_err(|source| Error::ImageLoad {
        path: path.to_path_buf(),
        source,
    })
}

/// Force an image to exactly three 8-bit channels.
///
/// Grayscale is replicated across channels and alpha is composited over a
/// white background. An RGB8 image is returned unchanged, so applying this
/// twice gives the same result as applying it once.
#[must_use]
pub fn force_rgb(img: &DynamicImage) -> RgbImage {
    match img {
        DynamicImage::ImageRgb8(rgb) => rgb.clone(),
        _ if img.color().has_alpha() => composite_over_white(img),
        _ => img.to_rgb8(),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn composite_over_white(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();

    RgbImage::from_fn(width, height, |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let alpha = f32::from(a) / 255.0;
        // Safe: clamped to [0, 255] before casting
        let blend = |c: u8| (f32::from(c) * alpha + 255.0 * (1.0 - alpha)).clamp(0.0, 255.0) as u8;
        Rgb([blend(r), blend(g), blend(b)])
    })
}

/// Compute the resampled size for an input of `width` x `height`.
///
/// Both sides are first multiplied by `upscale`. If the shorter side is then
/// below `min_size`, both sides are scaled so the shorter one equals
/// `min_size`. Each side is finally rounded up to a multiple of
/// `unit_resolution`.
///
/// # Errors
///
/// Returns an error for zero parameters, an empty image, or a size that does
/// not fit in `u32`.
pub fn target_dimensions(width: u32, height: u32, params: &PreprocessConfig) -> Result<(u32, u32)> {
    if params.upscale == 0 {
        return Err(Error::invalid("upscale", "must be at least 1"));
    }
    if params.min_size == 0 {
        return Err(Error::invalid("min_size", "must be greater than 0"));
    }
    if params.unit_resolution == 0 {
        return Err(Error::invalid("unit_resolution", "must be greater than 0"));
    }
    if width == 0 || height == 0 {
        return Err(Error::UnsupportedDimensions {
            width,
            height,
            reason: "image is empty".to_string(),
        });
    }

    let upscale = u64::from(params.upscale);
    let min_size = u64::from(params.min_size);
    let unit = u64::from(params.unit_resolution);

    let too_large = || Error::UnsupportedDimensions {
        width,
        height,
        reason: format!(
            "target size overflows for upscale {upscale}, min_size {min_size}, unit {unit}"
        ),
    };

    let scale = |side: u32| u64::from(side).checked_mul(upscale).ok_or_else(too_large);
    let (mut w, mut h) = (scale(width)?, scale(height)?);
    let short = w.min(h);
    if short < min_size {
        let grow = |side: u64| {
            side.checked_mul(min_size)
                .map(|v| v.div_ceil(short))
                .ok_or_else(too_large)
        };
        (w, h) = (grow(w)?, grow(h)?);
    }

    let align = |side: u64| {
        side.div_ceil(unit)
            .checked_mul(unit)
            .ok_or_else(too_large)
    };
    let (w, h) = (align(w)?, align(h)?);

    match (u32::try_from(w), u32::try_from(h)) {
        (Ok(w), Ok(h)) => Ok((w, h)),
        _ => Err(Error::UnsupportedDimensions {
            width,
            height,
            reason: format!("target size {w}x{h} is too large"),
        }),
    }
}

/// Preprocess a decoded image into the model's input tensor.
///
/// 1. Force three channels
/// 2. Resample to [`target_dimensions`] (Lanczos3 when enlarging)
/// 3. Map 8-bit values to [-1, 1] via `x / 255 * 2 - 1`
/// 4. Return as NCHW with a batch dimension of 1
///
/// # Errors
///
/// Returns an error if the parameters or image dimensions are invalid.
pub fn normalize(img: &DynamicImage, params: &PreprocessConfig) -> Result<ImageTensor> {
    let (width, height) = img.dimensions();
    let (target_w, target_h) = target_dimensions(width, height, params)?;

    let rgb = force_rgb(img);

    let resized = if (target_w, target_h) == (width, height) {
        rgb
    } else {
        let filter = if u64::from(target_w) * u64::from(target_h) > u64::from(width) * u64::from(height) {
            FilterType::Lanczos3
        } else {
            FilterType::Triangle
        };
        image::imageops::resize(&rgb, target_w, target_h, filter)
    };

    tracing::debug!("Resized {width}x{height} -> {target_w}x{target_h}");

    Ok(to_tensor(&resized))
}

/// Convert an RGB image to a normalized NCHW tensor.
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn to_tensor(rgb: &RgbImage) -> ImageTensor {
    let (width, height) = rgb.dimensions();
    let shape = (1, RGB_CHANNELS, height as usize, width as usize);

    // Safe: x and y are bounded by the image dimensions which are u32
    Array4::from_shape_fn(shape, |(_, c, y, x)| {
        let value = rgb.get_pixel(x as u32, y as u32)[c];
        f32::from(value) / 255.0 * 2.0 - 1.0
    })
}
