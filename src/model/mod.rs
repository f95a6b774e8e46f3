//! Restoration model adapters and checkpoint resolution.
//!
//! The diffusion network itself is opaque: the batch loop only needs
//! [`RestorationModel::restore`], which maps one low-quality tensor to one
//! restored tensor per requested sample.

mod loader;
mod onnx;

pub use loader::ModelCache;
pub use onnx::OnnxRestorer;

use crate::config::SamplingConfig;
use crate::device::DeviceId;
use crate::error::Result;
use crate::image::ImageTensor;

/// Whether a model must be moved onto its device after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// The model exposes a placement hook; [`RestorationModel::place`] must be
    /// called before the first restoration.
    Explicit,
    /// The model chose its device at construction time.
    Implicit,
}

/// Everything the sampling entry point receives besides the image.
#[derive(Debug, Clone, Copy)]
pub struct RestoreRequest<'a> {
    pub sampling: &'a SamplingConfig,
    /// Captions from the captioning model; empty when captioning is disabled.
    pub captions: &'a [String],
}

impl<'a> RestoreRequest<'a> {
    #[must_use]
    pub const fn new(sampling: &'a SamplingConfig) -> Self {
        Self {
            sampling,
            captions: &[],
        }
    }

    /// Seed used for the sample at `index`.
    #[must_use]
    pub fn sample_seed(&self, index: u32) -> u64 {
        self.sampling.seed.wrapping_add(u64::from(index))
    }
}

/// A loaded restoration model.
pub trait RestorationModel {
    /// Human-readable identifier used in logs and errors.
    fn name(&self) -> &str;

    /// Placement capability of this model.
    fn placement(&self) -> Placement {
        Placement::Implicit
    }

    /// Move the model onto `device`. Only called for [`Placement::Explicit`].
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be loaded onto the device.
    fn place(&mut self, device: DeviceId) -> Result<()> {
        let _ = device;
        Ok(())
    }

    /// Restore `lq` (NCHW, values in [-1, 1]).
    ///
    /// Returns `request.sampling.num_samples` tensors, each with the spatial
    /// size of `lq`.
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails.
    fn restore(&mut self, lq: &ImageTensor, request: &RestoreRequest<'_>) -> Result<Vec<ImageTensor>>;
}

macro_rules! forward_restoration_model {
    ($($ty:ty),*) => {
        $(
            impl<M: RestorationModel + ?Sized> RestorationModel for $ty {
                fn name(&self) -> &str {
                    (**self).name()
                }

                fn placement(&self) -> Placement {
                    (**self).placement()
                }

                fn place(&mut self, device: DeviceId) -> Result<()> {
                    (**self).place(device)
                }

                fn restore(
                    &mut self,
                    lq: &ImageTensor,
                    request: &RestoreRequest<'_>,
                ) -> Result<Vec<ImageTensor>> {
                    (**self).restore(lq, request)
                }
            }
        )*
    };
}

forward_restoration_model!(Box<M>, &mut M);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_seed_offsets_by_index() {
        let sampling = SamplingConfig {
            seed: u64::MAX,
            ..SamplingConfig::default()
        };
        let request = RestoreRequest::new(&sampling);
        assert_eq!(request.sample_seed(0), u64::MAX);
        assert_eq!(request.sample_seed(1), 0);
        assert!(request.captions.is_empty());
    }
}
