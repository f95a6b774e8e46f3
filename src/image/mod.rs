//! Image loading, preprocessing, and saving utilities.

pub mod color_fix;
mod load;
mod save;

pub use load::{force_rgb, load_image, normalize, target_dimensions, to_tensor};
pub use save::{denormalize, save_image, tensor_to_image};

use ndarray::Array4;

/// Image tensor in NCHW format (batch, channels, height, width).
/// Values are normalized to [-1, 1] range for diffusion model compatibility.
pub type ImageTensor = Array4<f32>;

/// Number of channels in RGB images.
pub const RGB_CHANNELS: usize = 3;

/// Spatial size `(height, width)` of an NCHW tensor.
#[must_use]
pub fn tensor_hw(tensor: &ImageTensor) -> (usize, usize) {
    let (_, _, height, width) = tensor.dim();
    (height, width)
}
