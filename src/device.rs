//! Accelerator discovery and role assignment.
//!
//! Two logical roles exist: the primary device hosts the restoration model and
//! the auxiliary device hosts the captioning model. With a single accelerator
//! both roles share it.

use std::fmt;
use std::process::Command;

use crate::error::{Error, Result};

/// Environment variable that restricts which CUDA devices are visible.
pub const VISIBLE_DEVICES_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// A CUDA device ordinal as seen by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub ordinal: u32,
}

impl DeviceId {
    #[must_use]
    pub const fn cuda(ordinal: u32) -> Self {
        Self { ordinal }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cuda:{}", self.ordinal)
    }
}

/// Devices chosen for the two model roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAssignment {
    /// Device hosting the restoration model.
    pub primary: DeviceId,
    /// Device hosting the captioning model.
    pub auxiliary: DeviceId,
}

impl DeviceAssignment {
    /// Assign roles from the list of available devices.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoAccelerator`] when `devices` is empty.
    pub fn from_devices(devices: &[DeviceId]) -> Result<Self> {
        match devices {
            [] => Err(Error::NoAccelerator),
            [only] => Ok(Self {
                primary: *only,
                auxiliary: *only,
            }),
            [first, second, ..] => Ok(Self {
                primary: *first,
                auxiliary: *second,
            }),
        }
    }

    /// Assign roles given only a device count, using ordinals `0..count`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoAccelerator`] when `count` is zero.
    pub fn from_count(count: u32) -> Result<Self> {
        let devices: Vec<DeviceId> = (0..count.min(2)).map(DeviceId::cuda).collect();
        Self::from_devices(&devices)
    }

    /// Whether both roles share one device.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.primary == self.auxiliary
    }
}

/// Enumerate the CUDA devices visible to this process.
///
/// `CUDA_VISIBLE_DEVICES` is authoritative when set. Otherwise `nvidia-smi` is
/// queried; if it is missing or fails, no devices are reported.
///
/// # Errors
///
/// Returns an error if `nvidia-smi` output cannot be parsed.
pub fn probe_devices() -> Result<Vec<DeviceId>> {
    if let Ok(visible) = std::env::var(VISIBLE_DEVICES_ENV) {
        let devices = parse_visible_devices(&visible);
        tracing::debug!(
            "{VISIBLE_DEVICES_ENV}={visible:?} exposes {} device(s)",
            devices.len()
        );
        return Ok(devices);
    }

    let output = match Command::new("nvidia-smi")
        .args(["--query-gpu=index", "--format=csv,noheader"])
        .output()
    {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            tracing::debug!("nvidia-smi exited with {}", output.status);
            return Ok(Vec::new());
        }
        Err(err) => {
            tracing::debug!("nvidia-smi unavailable: {err}");
            return Ok(Vec::new());
        }
    };

    parse_gpu_index_listing(&String::from_utf8_lossy(&output.stdout))
}

/// Parse a `CUDA_VISIBLE_DEVICES` value.
///
/// The runtime renumbers visible devices from zero, so only the number of valid
/// leading entries matters. Parsing stops at the first `-1` or empty entry, the
/// same way the CUDA runtime truncates the list.
#[must_use]
pub fn parse_visible_devices(value: &str) -> Vec<DeviceId> {
    let count = value
        .split(',')
        .map(str::trim)
        .take_while(|entry| !entry.is_empty() && !entry.starts_with('-'))
        .count();

    (0..count)
        .filter_map(|i| u32::try_from(i).ok())
        .map(DeviceId::cuda)
        .collect()
}

/// Parse `nvidia-smi --query-gpu=index --format=csv,noheader` output.
///
/// # Errors
///
/// Returns [`Error::DeviceQuery`] when a line is not a device index.
pub fn parse_gpu_index_listing(stdout: &str) -> Result<Vec<DeviceId>> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse::<u32>()
                .map(DeviceId::cuda)
                .map_err(|_| Error::DeviceQuery {
                    reason: format!("unexpected nvidia-smi line {line:?}"),
                })
        })
        .collect()
}
