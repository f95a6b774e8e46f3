//! Named option profiles stored as TOML files.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

use super::{ConfigOverrides, SupirSign};

/// Directory searched for `<profile>.toml` when none is given.
pub const DEFAULT_OPTIONS_DIR: &str = "options";

/// The option profiles shipped with the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ProfileName {
    #[value(name = "SUPIR_v0")]
    SupirV0,
    #[value(name = "SUPIR_v0_Juggernautv9_lightning_tiled")]
    SupirV0JuggernautLightningTiled,
    #[value(name = "SUPIR_v0_tiled")]
    SupirV0Tiled,
}

impl ProfileName {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SupirV0 => "SUPIR_v0",
            Self::SupirV0JuggernautLightningTiled => "SUPIR_v0_Juggernautv9_lightning_tiled",
            Self::SupirV0Tiled => "SUPIR_v0_tiled",
        }
    }

    /// Profile file name inside the options directory.
    #[must_use]
    pub fn file_name(self) -> String {
        format!("{}.toml", self.as_str())
    }
}

impl fmt::Display for ProfileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a checkpoint can be found.
///
/// A local `path` that exists is used as is; otherwise `url` is downloaded
/// into the model cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointSource {
    pub path: Option<PathBuf>,
    pub url: Option<String>,
}

/// Checkpoints keyed by [`SupirSign`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Checkpoints {
    #[serde(rename = "F")]
    pub fidelity: Option<CheckpointSource>,
    #[serde(rename = "Q")]
    pub quality: Option<CheckpointSource>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProfileFile {
    #[serde(default)]
    checkpoints: Checkpoints,
    #[serde(default)]
    defaults: ConfigOverrides,
}

/// A loaded option profile.
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub name: ProfileName,
    pub checkpoints: Checkpoints,
    pub defaults: ConfigOverrides,
}

impl Profile {
    /// Load `<options_dir>/<name>.toml`.
    ///
    /// Relative checkpoint paths are resolved against `options_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or malformed.
    pub fn load(options_dir: &Path, name: ProfileName) -> Result<Self> {
        let path = options_dir.join(name.file_name());
        let text = fs::read_to_string(&path).map_err(|err| Error::Profile {
            name: name.to_string(),
            reason: format!("cannot read {}: {err}", path.display()),
        })?;

        let mut profile = Self::parse(name, &text).map_err(|source| match source {
            Error::ProfileParse { source, .. } => Error::ProfileParse {
                path: path.clone(),
                source,
            },
            other => other,
        })?;

        for source in [
            profile.checkpoints.fidelity.as_mut(),
            profile.checkpoints.quality.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            if let Some(local) = source.path.as_mut() {
                if local.is_relative() {
                    *local = options_dir.join(&*local);
                }
            }
        }

        tracing::debug!("Loaded options profile {name} from {}", path.display());
        Ok(profile)
    }

    /// Parse profile text without touching the filesystem.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProfileParse`] for invalid TOML or unknown keys.
    pub fn parse(name: ProfileName, text: &str) -> Result<Self> {
        let file: ProfileFile = toml::from_str(text).map_err(|source| Error::ProfileParse {
            path: PathBuf::from(name.file_name()),
            source,
        })?;

        Ok(Self {
            name,
            checkpoints: file.checkpoints,
            defaults: file.defaults,
        })
    }

    /// The checkpoint configured for `sign`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Profile`] if the profile has no usable entry for `sign`.
    pub fn checkpoint(&self, sign: SupirSign) -> Result<&CheckpointSource> {
        let entry = match sign {
            SupirSign::F => self.checkpoints.fidelity.as_ref(),
            SupirSign::Q => self.checkpoints.quality.as_ref(),
        };

        entry
            .filter(|source| source.path.is_some() || source.url.is_some())
            .ok_or_else(|| Error::Profile {
                name: self.name.to_string(),
                reason: format!("no checkpoint configured for SUPIR_sign {sign}"),
            })
    }
}
