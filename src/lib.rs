//! # supir-batch
//!
//! Batch driver for SUPIR-style diffusion image restoration.
//!
//! Every image in a directory is forced to RGB, enlarged so both sides reach a
//! minimum size and align to the model's unit resolution, normalized to
//! [-1, 1], and handed to a [`RestorationModel`]. Each returned sample is
//! written as `<stem>_<index>.<ext>`.
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use supir_batch::config::{Config, ConfigOverrides, Profile, ProfileName};
//! use supir_batch::device::{probe_devices, DeviceAssignment};
//! use supir_batch::model::{ModelCache, OnnxRestorer};
//! use supir_batch::BatchRunner;
//!
//! # fn main() -> supir_batch::Result<()> {
//! let devices = DeviceAssignment::from_devices(&probe_devices()?)?;
//! let profile = Profile::load(Path::new("options"), ProfileName::SupirV0)?;
//! let config = Config::resolve("inputs".into(), "outputs".into(), &profile, &ConfigOverrides::default())?;
//!
//! let checkpoint = ModelCache::new()?.resolve(profile.checkpoint(config.model.supir_sign)?)?;
//! let model = OnnxRestorer::new(&checkpoint, config.model)?;
//!
//! let report = BatchRunner::new(config, devices, model)?.run()?;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod image;
pub mod model;
pub mod pipeline;

pub use config::Config;
pub use error::{Error, Result};
pub use model::{Placement, RestorationModel, RestoreRequest};
pub use pipeline::{BatchReport, BatchRunner};
