//! Image saving utilities.

use std::path::Path;

use image::{DynamicImage, Rgb, RgbImage};

use crate::config::OutputFormat;
use crate::error::{Error, Result};

use super::{ImageTensor, RGB_CHANNELS};

/// Save a sample tensor as an image file.
///
/// The tensor is denormalized from [-1, 1] to [0, 255] and written at its own
/// spatial size.
///
/// # Arguments
///
/// * `tensor` - NCHW tensor with values in [-1, 1]
/// * `path` - Output file path
/// * `format` - Container format
/// * `quality` - JPEG quality (1-100), ignored for other formats
///
/// # Errors
///
/// Returns an error if the tensor is not an RGB image or the file cannot be written.
pub fn save_image<P: AsRef<Path>>(
    tensor: &ImageTensor,
    path: P,
    format: OutputFormat,
    quality: u8,
) -> Result<()> {
    let path = path.as_ref();

    let img = DynamicImage::ImageRgb8(tensor_to_image(tensor)?);

    match format {
        OutputFormat::Jpg => {
            let mut output = std::io::BufWriter::new(std::fs::File::create(path)?);
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut output, quality);
            img.write_with_encoder(encoder)
                .map_err(|source| Error::ImageSave {
                    path: path.to_path_buf(),
                    source,
                })?;
        }
        OutputFormat::Png => {
            img.save_with_format(path, image::ImageFormat::Png)
                .map_err(|source| Error::ImageSave {
                    path: path.to_path_buf(),
                    source,
                })?;
        }
    }

    Ok(())
}

/// Convert the first image of a normalized NCHW tensor to an RGB image.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] if the tensor is empty or has fewer than
/// three channels.
#[allow(clippy::cast_possible_truncation)]
pub fn tensor_to_image(tensor: &ImageTensor) -> Result<RgbImage> {
    let (batch, channels, height, width) = tensor.dim();
    if batch == 0 || channels < RGB_CHANNELS {
        return Err(Error::ShapeMismatch {
            expected: "(N>=1, 3, H, W)".to_string(),
            actual: format!("{:?}", tensor.shape()),
        });
    }

    let (Ok(w), Ok(h)) = (u32::try_from(width), u32::try_from(height)) else {
        return Err(Error::ShapeMismatch {
            expected: "spatial size within u32".to_string(),
            actual: format!("{width}x{height}"),
        });
    };

    Ok(RgbImage::from_fn(w, h, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([
            denormalize(tensor[[0, 0, y, x]]),
            denormalize(tensor[[0, 1, y, x]]),
            denormalize(tensor[[0, 2, y, x]]),
        ])
    }))
}

/// Denormalize a value from [-1, 1] to [0, 255] with rounding and clamping.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn denormalize(value: f32) -> u8 {
    // Safe: clamped to [0, 255] range before casting
    let scaled = ((value + 1.0) * 127.5).round();
    scaled.clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn test_denormalize() {
        assert_eq!(denormalize(-1.0), 0);
        assert_eq!(denormalize(0.0), 128);
        assert_eq!(denormalize(1.0), 255);
    }

    #[test]
    fn test_denormalize_clamp() {
        assert_eq!(denormalize(-2.0), 0);
        assert_eq!(denormalize(2.0), 255);
        assert_eq!(denormalize(f32::NAN), 0);
    }

    #[test]
    fn test_tensor_to_image_keeps_size() {
        let tensor = Array4::<f32>::ones((1, 3, 64, 96));
        let img = tensor_to_image(&tensor).unwrap();
        assert_eq!(img.dimensions(), (96, 64));
        assert!(img.pixels().all(|p| p.0 == [255, 255, 255]));
    }

    #[test]
    fn test_tensor_to_image_rejects_single_channel() {
        let tensor = Array4::<f32>::zeros((1, 1, 8, 8));
        assert!(matches!(
            tensor_to_image(&tensor),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_save_png_and_jpg() {
        let dir = tempfile::tempdir().unwrap();
        let tensor = Array4::<f32>::zeros((1, 3, 32, 32));

        let png = dir.path().join("a_0.png");
        save_image(&tensor, &png, OutputFormat::Png, 95).unwrap();
        assert_eq!(image::open(&png).unwrap().to_rgb8().dimensions(), (32, 32));

        let jpg = dir.path().join("a_0.jpg");
        save_image(&tensor, &jpg, OutputFormat::Jpg, 90).unwrap();
        assert!(jpg.exists());
    }
}
