//! Run configuration: built-in defaults, option profiles, and CLI overrides.
//!
//! A [`Config`] is resolved once per process and is read-only afterwards.
//! Layers are applied in order: [`Config::default`], the profile's
//! `[defaults]` table, then the command line. Both override layers use
//! [`ConfigOverrides`].

mod profile;

use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Error, Result};

pub use profile::{CheckpointSource, Checkpoints, Profile, ProfileName, DEFAULT_OPTIONS_DIR};

/// Default positive prompt appended to every restoration.
pub const DEFAULT_POSITIVE_PROMPT: &str = "Cinematic, High Contrast, highly detailed, taken using a Canon EOS R \
camera, hyper detailed photo - realistic maximum detail, 32k, Color Grading, ultra HD, extreme meticulous \
detailing, skin pore detailing, hyper sharpness, perfect without deformations.";

/// Default negative prompt.
pub const DEFAULT_NEGATIVE_PROMPT: &str = "painting, oil painting, illustration, drawing, art, sketch, oil painting, \
cartoon, CG Style, 3D render, unreal engine, blurring, dirty, messy, worst quality, low quality, frames, \
watermark, signature, jpeg artifacts, deformed, lowres, over-smooth";

/// Spatial unit the restoration model's downsampling requires.
pub const DEFAULT_UNIT_RESOLUTION: u32 = 32;

/// Pixels shared by neighbouring tiles on each side when tiling without `fast`.
pub const TILE_OVERLAP: u32 = 32;

/// Checkpoint variant: `F` (fidelity) or `Q` (quality).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, clap::ValueEnum)]
pub enum SupirSign {
    #[value(name = "F")]
    F,
    #[value(name = "Q")]
    Q,
}

impl fmt::Display for SupirSign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F => write!(f, "F"),
            Self::Q => write!(f, "Q"),
        }
    }
}

/// Post-processing used to correct color drift in restored samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
pub enum ColorFixType {
    #[value(name = "None")]
    None,
    #[value(name = "AdaIn")]
    AdaIn,
    #[value(name = "Wavelet")]
    Wavelet,
}

/// Diffusion sampler family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
pub enum Sampler {
    #[value(name = "EDM")]
    #[serde(rename = "EDM")]
    Edm,
    #[value(name = "DPMPP2M")]
    #[serde(rename = "DPMPP2M")]
    Dpmpp2m,
}

impl fmt::Display for Sampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Edm => write!(f, "EDM"),
            Self::Dpmpp2m => write!(f, "DPMPP2M"),
        }
    }
}

/// Numeric precision for model components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Fp32,
    Fp16,
    Bf16,
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fp32 => write!(f, "fp32"),
            Self::Fp16 => write!(f, "fp16"),
            Self::Bf16 => write!(f, "bf16"),
        }
    }
}

impl Dtype {
    /// Whether values are stored in 16 bits.
    #[must_use]
    pub const fn is_half(self) -> bool {
        matches!(self, Self::Fp16 | Self::Bf16)
    }
}

/// Container format for restored samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Png,
    Jpg,
}

impl OutputFormat {
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpg => "jpg",
        }
    }
}

/// Resize contract applied to every input before restoration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreprocessConfig {
    /// Minimum enlargement factor.
    pub upscale: u32,
    /// Both output sides are at least this many pixels.
    pub min_size: u32,
    /// Both output sides are multiples of this.
    pub unit_resolution: u32,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            upscale: 1,
            min_size: 1024,
            unit_resolution: DEFAULT_UNIT_RESOLUTION,
        }
    }
}

/// Parameters forwarded to the restoration model's sampling entry point.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    pub edm_steps: u32,
    /// Restoration guidance scale; negative disables it.
    pub s_stage1: f32,
    /// Control scale.
    pub s_stage2: f32,
    pub s_churn: f32,
    pub s_noise: f32,
    /// Classifier-free guidance scale.
    pub s_cfg: f32,
    pub seed: u64,
    pub num_samples: u32,
    pub a_prompt: String,
    pub n_prompt: String,
    pub color_fix_type: ColorFixType,
    pub linear_cfg: bool,
    pub linear_s_stage2: bool,
    /// Starting CFG scale when `linear_cfg` is set.
    pub spt_linear_cfg: f32,
    /// Starting control scale when `linear_s_stage2` is set.
    pub spt_linear_s_stage2: f32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            edm_steps: 50,
            s_stage1: -1.0,
            s_stage2: 1.0,
            s_churn: 5.0,
            s_noise: 1.003,
            s_cfg: 7.5,
            seed: 1234,
            num_samples: 1,
            a_prompt: DEFAULT_POSITIVE_PROMPT.to_string(),
            n_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
            color_fix_type: ColorFixType::Wavelet,
            linear_cfg: true,
            linear_s_stage2: false,
            spt_linear_cfg: 4.0,
            spt_linear_s_stage2: 0.0,
        }
    }
}

/// Tiled encode/decode settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileConfig {
    pub enabled: bool,
    pub encoder_tile_size: u32,
    pub decoder_tile_size: u32,
    /// Trade seam quality for speed.
    pub fast: bool,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            encoder_tile_size: 512,
            decoder_tile_size: 64,
            fast: false,
        }
    }
}

/// How the restoration model is built and placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelConfig {
    pub supir_sign: SupirSign,
    pub sampler: Sampler,
    pub ae_dtype: Dtype,
    pub diff_dtype: Dtype,
    pub loading_half_params: bool,
    pub tile: TileConfig,
    pub no_llava: bool,
    pub load_8bit_llava: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            supir_sign: SupirSign::Q,
            sampler: Sampler::Dpmpp2m,
            ae_dtype: Dtype::Bf16,
            diff_dtype: Dtype::Fp16,
            loading_half_params: false,
            tile: TileConfig::default(),
            no_llava: false,
            load_8bit_llava: false,
        }
    }
}

impl ModelConfig {
    /// Sampler class name, e.g. `TiledRestoreEDMSampler`.
    #[must_use]
    pub fn sampler_class(&self) -> String {
        let tiled = if self.tile.enabled { "TiledRestore" } else { "Restore" };
        format!("{tiled}{}Sampler", self.sampler)
    }
}

/// Where and how samples are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputConfig {
    pub format: OutputFormat,
    /// JPEG quality (1-100), ignored for PNG.
    pub quality: u8,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Png,
            quality: 95,
        }
    }
}

/// Fully resolved configuration for one batch run.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub img_dir: PathBuf,
    pub save_dir: PathBuf,
    pub profile: ProfileName,
    pub preprocess: PreprocessConfig,
    pub sampling: SamplingConfig,
    pub model: ModelConfig,
    pub output: OutputConfig,
    /// Abort on the first per-image failure instead of skipping the image.
    pub fail_fast: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            img_dir: PathBuf::new(),
            save_dir: PathBuf::new(),
            profile: ProfileName::SupirV0,
            preprocess: PreprocessConfig::default(),
            sampling: SamplingConfig::default(),
            model: ModelConfig::default(),
            output: OutputConfig::default(),
            fail_fast: false,
        }
    }
}

impl Config {
    /// Resolve a configuration from a profile and command-line overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting configuration is invalid.
    pub fn resolve(
        img_dir: PathBuf,
        save_dir: PathBuf,
        profile: &Profile,
        cli: &ConfigOverrides,
    ) -> Result<Self> {
        let mut config = Self {
            img_dir,
            save_dir,
            profile: profile.name,
            ..Self::default()
        };

        profile.defaults.apply(&mut config);
        cli.apply(&mut config);

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        let pre = &self.preprocess;
        if pre.upscale == 0 {
            return Err(Error::invalid("upscale", "must be at least 1"));
        }
        if pre.min_size == 0 {
            return Err(Error::invalid("min_size", "must be greater than 0"));
        }
        if pre.unit_resolution == 0 {
            return Err(Error::invalid("unit_resolution", "must be greater than 0"));
        }

        let sampling = &self.sampling;
        if sampling.edm_steps == 0 {
            return Err(Error::invalid("edm_steps", "must be greater than 0"));
        }
        if sampling.num_samples == 0 {
            return Err(Error::invalid("num_samples", "must be greater than 0"));
        }
        if !(sampling.s_noise.is_finite() && sampling.s_noise > 0.0) {
            return Err(Error::invalid("s_noise", "must be a positive number"));
        }

        if self.model.ae_dtype == Dtype::Fp16 {
            return Err(Error::invalid("ae_dtype", "must be fp32 or bf16"));
        }

        let tile = &self.model.tile;
        if tile.enabled {
            for (name, size) in [
                ("encoder_tile_size", tile.encoder_tile_size),
                ("decoder_tile_size", tile.decoder_tile_size),
            ] {
                if size == 0 || size % pre.unit_resolution != 0 {
                    return Err(Error::invalid(
                        name,
                        format!(
                            "must be a positive multiple of {}",
                            pre.unit_resolution
                        ),
                    ));
                }
            }

            let overlap = if tile.fast { 0 } else { TILE_OVERLAP };
            if tile.encoder_tile_size <= overlap * 2 {
                return Err(Error::invalid(
                    "encoder_tile_size",
                    format!(
                        "must exceed {} to leave room for the {overlap}px tile overlap",
                        overlap * 2
                    ),
                ));
            }
        }

        if !(1..=100).contains(&self.output.quality) {
            return Err(Error::invalid("quality", "must be between 1 and 100"));
        }

        Ok(())
    }
}

/// Optional value for every tunable parameter.
///
/// Used both for a profile's `[defaults]` table and for command-line flags;
/// `None` leaves the lower layer untouched.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigOverrides {
    pub upscale: Option<u32>,
    pub min_size: Option<u32>,
    pub unit_resolution: Option<u32>,
    pub edm_steps: Option<u32>,
    pub s_stage1: Option<f32>,
    pub s_stage2: Option<f32>,
    pub s_churn: Option<f32>,
    pub s_noise: Option<f32>,
    pub s_cfg: Option<f32>,
    pub seed: Option<u64>,
    pub num_samples: Option<u32>,
    pub a_prompt: Option<String>,
    pub n_prompt: Option<String>,
    pub color_fix_type: Option<ColorFixType>,
    pub linear_cfg: Option<bool>,
    pub linear_s_stage2: Option<bool>,
    pub spt_linear_cfg: Option<f32>,
    pub spt_linear_s_stage2: Option<f32>,
    pub supir_sign: Option<SupirSign>,
    pub sampler: Option<Sampler>,
    pub ae_dtype: Option<Dtype>,
    pub diff_dtype: Option<Dtype>,
    pub loading_half_params: Option<bool>,
    pub use_tile_vae: Option<bool>,
    pub encoder_tile_size: Option<u32>,
    pub decoder_tile_size: Option<u32>,
    pub use_fast_tile: Option<bool>,
    pub no_llava: Option<bool>,
    pub load_8bit_llava: Option<bool>,
    pub format: Option<OutputFormat>,
    pub quality: Option<u8>,
    pub fail_fast: Option<bool>,
}

/// Assign `$src` into `$dst` when present.
macro_rules! set_if_some {
    ($dst:expr, $src:expr) => {
        if let Some(value) = $src.clone() {
            $dst = value;
        }
    };
}

impl ConfigOverrides {
    /// Apply every present value onto `config`.
    pub fn apply(&self, config: &mut Config) {
        let pre = &mut config.preprocess;
        set_if_some!(pre.upscale, self.upscale);
        set_if_some!(pre.min_size, self.min_size);
        set_if_some!(pre.unit_resolution, self.unit_resolution);

        let s = &mut config.sampling;
        set_if_some!(s.edm_steps, self.edm_steps);
        set_if_some!(s.s_stage1, self.s_stage1);
        set_if_some!(s.s_stage2, self.s_stage2);
        set_if_some!(s.s_churn, self.s_churn);
        set_if_some!(s.s_noise, self.s_noise);
        set_if_some!(s.s_cfg, self.s_cfg);
        set_if_some!(s.seed, self.seed);
        set_if_some!(s.num_samples, self.num_samples);
        set_if_some!(s.a_prompt, self.a_prompt);
        set_if_some!(s.n_prompt, self.n_prompt);
        set_if_some!(s.color_fix_type, self.color_fix_type);
        set_if_some!(s.linear_cfg, self.linear_cfg);
        set_if_some!(s.linear_s_stage2, self.linear_s_stage2);
        set_if_some!(s.spt_linear_cfg, self.spt_linear_cfg);
        set_if_some!(s.spt_linear_s_stage2, self.spt_linear_s_stage2);

        let m = &mut config.model;
        set_if_some!(m.supir_sign, self.supir_sign);
        set_if_some!(m.sampler, self.sampler);
        set_if_some!(m.ae_dtype, self.ae_dtype);
        set_if_some!(m.diff_dtype, self.diff_dtype);
        set_if_some!(m.loading_half_params, self.loading_half_params);
        set_if_some!(m.tile.enabled, self.use_tile_vae);
        set_if_some!(m.tile.encoder_tile_size, self.encoder_tile_size);
        set_if_some!(m.tile.decoder_tile_size, self.decoder_tile_size);
        set_if_some!(m.tile.fast, self.use_fast_tile);
        set_if_some!(m.no_llava, self.no_llava);
        set_if_some!(m.load_8bit_llava, self.load_8bit_llava);

        set_if_some!(config.output.format, self.format);
        set_if_some!(config.output.quality, self.quality);
        set_if_some!(config.fail_fast, self.fail_fast);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile_with(defaults: ConfigOverrides) -> Profile {
        Profile {
            name: ProfileName::SupirV0Tiled,
            checkpoints: Checkpoints::default(),
            defaults,
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sampling.seed, 1234);
        assert_eq!(config.preprocess.min_size, 1024);
        assert_eq!(config.model.sampler_class(), "RestoreDPMPP2MSampler");
    }

    #[test]
    fn test_cli_overrides_profile_defaults() {
        let profile = profile_with(ConfigOverrides {
            edm_steps: Some(8),
            use_tile_vae: Some(true),
            s_cfg: Some(2.0),
            ..ConfigOverrides::default()
        });
        let cli = ConfigOverrides {
            s_cfg: Some(4.5),
            ..ConfigOverrides::default()
        };

        let config = Config::resolve("in".into(), "out".into(), &profile, &cli).unwrap();

        assert_eq!(config.profile, ProfileName::SupirV0Tiled);
        assert_eq!(config.sampling.edm_steps, 8);
        assert!((config.sampling.s_cfg - 4.5).abs() < f32::EPSILON);
        assert!(config.model.tile.enabled);
        assert_eq!(config.model.sampler_class(), "TiledRestoreDPMPP2MSampler");
    }

    #[test]
    fn test_rejects_zero_min_size_and_unit() {
        let mut config = Config::default();
        config.preprocess.min_size = 0;
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidParameter { ref name, .. }) if name == "min_size"
        ));

        let mut config = Config::default();
        config.preprocess.unit_resolution = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_misaligned_tiles_only_when_tiling() {
        let mut config = Config::default();
        config.model.tile.encoder_tile_size = 500;
        assert!(config.validate().is_ok());

        config.model.tile.enabled = true;
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidParameter { ref name, .. }) if name == "encoder_tile_size"
        ));
    }

    #[test]
    fn test_rejects_tiles_consumed_by_overlap() {
        let mut config = Config::default();
        config.model.tile.enabled = true;
        config.model.tile.encoder_tile_size = 64;
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidParameter { ref name, .. }) if name == "encoder_tile_size"
        ));

        config.model.tile.fast = true;
        assert!(config.validate().is_ok());

        config.model.tile.fast = false;
        config.model.tile.encoder_tile_size = 96;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_fp16_autoencoder() {
        let mut config = Config::default();
        config.model.ae_dtype = Dtype::Fp16;
        assert!(config.validate().is_err());

        config.model.ae_dtype = Dtype::Fp32;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_samples() {
        let profile = profile_with(ConfigOverrides::default());
        let cli = ConfigOverrides {
            num_samples: Some(0),
            ..ConfigOverrides::default()
        };
        assert!(Config::resolve("in".into(), "out".into(), &profile, &cli).is_err());
    }

    #[test]
    fn test_overrides_parse_from_toml() {
        let overrides: ConfigOverrides = toml::from_str(
            r#"
            sampler = "EDM"
            color_fix_type = "AdaIn"
            diff_dtype = "bf16"
            format = "jpg"
            "#,
        )
        .unwrap();
        assert_eq!(overrides.sampler, Some(Sampler::Edm));
        assert_eq!(overrides.color_fix_type, Some(ColorFixType::AdaIn));
        assert_eq!(overrides.diff_dtype, Some(Dtype::Bf16));
        assert_eq!(overrides.format, Some(OutputFormat::Jpg));

        assert!(toml::from_str::<ConfigOverrides>("unknown_key = 1").is_err());
    }
}
