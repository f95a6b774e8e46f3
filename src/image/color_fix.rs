//! Color correction of restored samples against the low-quality input.
//!
//! Diffusion restoration tends to drift in global color. Both strategies keep
//! the detail of the restored sample and borrow color from the reference.

use ndarray::{Array2, ArrayView2, Axis};

use crate::config::ColorFixType;

use super::ImageTensor;

/// Number of wavelet levels separating detail from color.
const WAVELET_LEVELS: u32 = 5;

/// Added to the variance before taking the square root.
const ADAIN_EPS: f32 = 1e-5;

/// 3x3 binomial kernel used for the a-trous wavelet blur.
const BLUR_KERNEL: [[f32; 3]; 3] = [
    [0.0625, 0.125, 0.0625],
    [0.125, 0.25, 0.125],
    [0.0625, 0.125, 0.0625],
];

/// Apply the configured color fix to `restored` using `reference` colors.
///
/// Both tensors must share the same shape; otherwise `restored` is returned as is.
#[must_use]
pub fn apply(kind: ColorFixType, restored: &ImageTensor, reference: &ImageTensor) -> ImageTensor {
    if restored.dim() != reference.dim() {
        tracing::warn!(
            "Skipping color fix: sample {:?} and reference {:?} differ in shape",
            restored.shape(),
            reference.shape()
        );
        return restored.clone();
    }

    match kind {
        ColorFixType::None => restored.clone(),
        ColorFixType::AdaIn => adain(restored, reference),
        ColorFixType::Wavelet => wavelet(restored, reference),
    }
}

/// Adaptive instance normalization: match per-channel mean and std of `style`.
#[must_use]
pub fn adain(content: &ImageTensor, style: &ImageTensor) -> ImageTensor {
    let mut out = content.clone();

    for (mut out_item, style_item) in out.outer_iter_mut().zip(style.outer_iter()) {
        for (mut channel, style_channel) in out_item
            .outer_iter_mut()
            .zip(style_item.axis_iter(Axis(0)))
        {
            let (c_mean, c_std) = mean_std(channel.view());
            let (s_mean, s_std) = mean_std(style_channel);
            channel.mapv_inplace(|v| (v - c_mean) / c_std * s_std + s_mean);
        }
    }

    out
}

#[allow(clippy::cast_precision_loss)]
fn mean_std(channel: ArrayView2<'_, f32>) -> (f32, f32) {
    let n = channel.len();
    if n == 0 {
        return (0.0, ADAIN_EPS.sqrt());
    }

    let mean = channel.sum() / n as f32;
    let sum_sq: f32 = channel.iter().map(|v| (v - mean) * (v - mean)).sum();
    let var = if n > 1 { sum_sq / (n - 1) as f32 } else { 0.0 };

    (mean, (var + ADAIN_EPS).sqrt())
}

/// Keep the high-frequency wavelet bands of `content` and the low band of `style`.
#[must_use]
pub fn wavelet(content: &ImageTensor, style: &ImageTensor) -> ImageTensor {
    let mut out = content.clone();

    for (mut out_item, style_item) in out.outer_iter_mut().zip(style.outer_iter()) {
        for (mut channel, style_channel) in out_item
            .outer_iter_mut()
            .zip(style_item.axis_iter(Axis(0)))
        {
            let (high, _) = decompose(channel.view());
            let (_, low) = decompose(style_channel);
            channel.assign(&(high + low));
        }
    }

    out
}

/// Split a channel into (high-frequency, low-frequency) parts that sum to it.
fn decompose(channel: ArrayView2<'_, f32>) -> (Array2<f32>, Array2<f32>) {
    let mut low = channel.to_owned();
    let mut high = Array2::<f32>::zeros(channel.raw_dim());

    for level in 0..WAVELET_LEVELS {
        let blurred = blur(low.view(), 1 << level);
        high += &(&low - &blurred);
        low = blurred;
    }

    (high, low)
}

/// Dilated 3x3 blur with replicate padding.
fn blur(channel: ArrayView2<'_, f32>, dilation: usize) -> Array2<f32> {
    let (height, width) = channel.dim();
    if height == 0 || width == 0 {
        return channel.to_owned();
    }

    let offset = |pos: usize, k: usize, len: usize| -> usize {
        match k {
            0 => pos.saturating_sub(dilation),
            1 => pos,
            _ => (pos + dilation).min(len - 1),
        }
    };

    Array2::from_shape_fn((height, width), |(y, x)| {
        let mut acc = 0.0;
        for (ky, row) in BLUR_KERNEL.iter().enumerate() {
            let sy = offset(y, ky, height);
            for (kx, weight) in row.iter().enumerate() {
                acc += weight * channel[[sy, offset(x, kx, width)]];
            }
        }
        acc
    })
}
