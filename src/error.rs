//! Custom error types for supir-batch.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the supir-batch library.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid parameter value.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    /// An options profile could not be read or is incomplete.
    #[error("options profile {name}: {reason}")]
    Profile { name: String, reason: String },

    /// An options profile is not valid TOML.
    #[error("failed to parse options profile {path}: {source}")]
    ProfileParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// No accelerator is available to host the model.
    #[error("no compatible accelerator found (CUDA only)")]
    NoAccelerator,

    /// The accelerator listing could not be interpreted.
    #[error("failed to query accelerators: {reason}")]
    DeviceQuery { reason: String },

    /// Failed to load an image file.
    #[error("failed to load image from {path}: {source}")]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Failed to save an image file.
    #[error("failed to save image to {path}: {source}")]
    ImageSave {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Image dimensions are not supported.
    #[error("unsupported image dimensions {width}x{height}: {reason}")]
    UnsupportedDimensions {
        width: u32,
        height: u32,
        reason: String,
    },

    /// Failed to download a checkpoint.
    #[error("failed to download checkpoint {name}: {source}")]
    ModelDownload {
        name: String,
        #[source]
        source: reqwest::Error,
    },

    /// Failed to load an ONNX model.
    #[error("failed to load ONNX model {name}: {source}")]
    ModelLoad {
        name: String,
        #[source]
        source: ort::Error,
    },

    /// The model was asked to restore before being placed on a device.
    #[error("model {name} has not been placed on a device")]
    ModelNotPlaced { name: String },

    /// Model inference failed.
    #[error("model inference failed: {source}")]
    Inference {
        #[source]
        source: ort::Error,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Shape mismatch in tensor operations.
    #[error("tensor shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    /// A fatal error interrupted the batch.
    #[error("batch aborted with {restored} of {total} images restored: {source}")]
    BatchAborted {
        restored: usize,
        total: usize,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Whether the batch loop may record this failure and move on to the next image.
    ///
    /// Decode and inference failures are tied to a single input. Anything touching
    /// the output directory or the configuration is treated as fatal.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ImageLoad { .. }
                | Self::UnsupportedDimensions { .. }
                | Self::Inference { .. }
                | Self::ShapeMismatch { .. }
        )
    }

    pub(crate) fn invalid(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for supir-batch operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let decode = Error::UnsupportedDimensions {
            width: 0,
            height: 0,
            reason: "empty".to_string(),
        };
        assert!(decode.is_recoverable());

        let io = Error::Io(std::io::Error::other("disk full"));
        assert!(!io.is_recoverable());
        assert!(!Error::NoAccelerator.is_recoverable());
    }

    #[test]
    fn test_batch_aborted_message() {
        let err = Error::BatchAborted {
            restored: 3,
            total: 10,
            source: Box::new(Error::Io(std::io::Error::other("disk full"))),
        };
        assert_eq!(
            err.to_string(),
            "batch aborted with 3 of 10 images restored: IO error: disk full"
        );
    }
}
