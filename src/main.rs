//! `supir-batch` CLI - Restore a directory of images with a SUPIR model.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use supir_batch::config::{
    ColorFixType, Config, ConfigOverrides, Dtype, OutputFormat, Profile, ProfileName, Sampler,
    SupirSign, DEFAULT_OPTIONS_DIR,
};
use supir_batch::device::{probe_devices, DeviceAssignment};
use supir_batch::model::{ModelCache, OnnxRestorer};
use supir_batch::{BatchReport, BatchRunner, Error};

/// Nothing was written: setup failed, or the batch stopped before any image was restored.
const EXIT_NO_OUTPUT: u8 = 1;

/// Some images were restored, others failed.
const EXIT_PARTIAL: u8 = 2;

/// Restore every image in a directory with a SUPIR diffusion model.
#[derive(Parser, Debug)]
#[command(name = "supir-batch")]
#[command(version, about, long_about = None)]
#[allow(non_snake_case)]
struct Args {
    /// Directory of input images (not searched recursively).
    #[arg(long = "img_dir", value_name = "DIR")]
    img_dir: PathBuf,

    /// Directory for restored samples; created if missing.
    #[arg(long = "save_dir", value_name = "DIR")]
    save_dir: PathBuf,

    /// Minimum upscale factor.
    #[arg(long, value_name = "INT", value_parser = clap::value_parser!(u32).range(1..))]
    upscale: Option<u32>,

    /// Checkpoint variant.
    #[arg(long = "SUPIR_sign", value_enum)]
    SUPIR_sign: Option<SupirSign>,

    /// Random seed for reproducibility.
    #[arg(long, value_name = "INT")]
    seed: Option<u64>,

    /// Minimum output side length in pixels.
    #[arg(long = "min_size", value_name = "INT")]
    min_size: Option<u32>,

    /// Number of diffusion steps.
    #[arg(long = "edm_steps", value_name = "INT")]
    edm_steps: Option<u32>,

    /// Restoration guidance scale; negative disables it.
    #[arg(long = "s_stage1", value_name = "FLOAT", allow_hyphen_values = true)]
    s_stage1: Option<f32>,

    /// Control scale.
    #[arg(long = "s_stage2", value_name = "FLOAT", allow_hyphen_values = true)]
    s_stage2: Option<f32>,

    #[arg(long = "s_churn", value_name = "FLOAT")]
    s_churn: Option<f32>,

    #[arg(long = "s_noise", value_name = "FLOAT")]
    s_noise: Option<f32>,

    /// Classifier-free guidance scale.
    #[arg(long = "s_cfg", value_name = "FLOAT")]
    s_cfg: Option<f32>,

    /// Samples written per input image.
    #[arg(long = "num_samples", value_name = "INT", value_parser = clap::value_parser!(u32).range(1..))]
    num_samples: Option<u32>,

    /// Positive prompt.
    #[arg(long = "a_prompt", value_name = "TEXT")]
    a_prompt: Option<String>,

    /// Negative prompt.
    #[arg(long = "n_prompt", value_name = "TEXT")]
    n_prompt: Option<String>,

    /// Color correction applied to each sample.
    #[arg(long = "color_fix_type", value_enum)]
    color_fix_type: Option<ColorFixType>,

    /// Ramp CFG linearly from `spt_linear_CFG` (pass `false` to disable).
    #[arg(long = "linear_CFG", value_name = "BOOL", num_args = 0..=1, default_missing_value = "true")]
    linear_CFG: Option<bool>,

    /// Ramp the control scale linearly from `spt_linear_s_stage2`.
    #[arg(long = "linear_s_stage2", action = ArgAction::SetTrue)]
    linear_s_stage2: bool,

    #[arg(long = "spt_linear_CFG", value_name = "FLOAT")]
    spt_linear_CFG: Option<f32>,

    #[arg(long = "spt_linear_s_stage2", value_name = "FLOAT", allow_hyphen_values = true)]
    spt_linear_s_stage2: Option<f32>,

    /// Autoencoder precision (fp32 or bf16).
    #[arg(long = "ae_dtype", value_enum)]
    ae_dtype: Option<Dtype>,

    /// Diffusion precision.
    #[arg(long = "diff_dtype", value_enum)]
    diff_dtype: Option<Dtype>,

    /// Do not load the captioning model.
    #[arg(long = "no_llava", action = ArgAction::SetTrue)]
    no_llava: bool,

    /// Load model parameters in half precision.
    #[arg(long = "loading_half_params", action = ArgAction::SetTrue)]
    loading_half_params: bool,

    /// Encode and decode in tiles to bound memory use.
    #[arg(long = "use_tile_vae", action = ArgAction::SetTrue)]
    use_tile_vae: bool,

    #[arg(long = "encoder_tile_size", value_name = "INT")]
    encoder_tile_size: Option<u32>,

    #[arg(long = "decoder_tile_size", value_name = "INT")]
    decoder_tile_size: Option<u32>,

    /// Load the captioning model in 8 bit.
    #[arg(long = "load_8bit_llava", action = ArgAction::SetTrue)]
    load_8bit_llava: bool,

    /// Named options profile.
    #[arg(long, value_enum, default_value = "SUPIR_v0")]
    options: ProfileName,

    /// Directory holding `<profile>.toml` files.
    #[arg(long = "options_dir", value_name = "DIR", default_value = DEFAULT_OPTIONS_DIR)]
    options_dir: PathBuf,

    /// Diffusion sampler.
    #[arg(long, value_enum)]
    sampler: Option<Sampler>,

    /// Use a faster tile encoding/decoding, may impact quality.
    #[arg(long = "use_fast_tile", action = ArgAction::SetTrue)]
    use_fast_tile: bool,

    /// Output image format.
    #[arg(long, value_enum)]
    format: Option<OutputFormat>,

    /// Output JPEG quality (1-100).
    #[arg(short, long, value_name = "INT")]
    quality: Option<u8>,

    /// Abort on the first failed image instead of skipping it.
    #[arg(long = "fail_fast", action = ArgAction::SetTrue)]
    fail_fast: bool,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let flag = |set: bool| set.then_some(true);

        ConfigOverrides {
            upscale: self.upscale,
            min_size: self.min_size,
            unit_resolution: None,
            edm_steps: self.edm_steps,
            s_stage1: self.s_stage1,
            s_stage2: self.s_stage2,
            s_churn: self.s_churn,
            s_noise: self.s_noise,
            s_cfg: self.s_cfg,
            seed: self.seed,
            num_samples: self.num_samples,
            a_prompt: self.a_prompt.clone(),
            n_prompt: self.n_prompt.clone(),
            color_fix_type: self.color_fix_type,
            linear_cfg: self.linear_CFG,
            linear_s_stage2: flag(self.linear_s_stage2),
            spt_linear_cfg: self.spt_linear_CFG,
            spt_linear_s_stage2: self.spt_linear_s_stage2,
            supir_sign: self.SUPIR_sign,
            sampler: self.sampler,
            ae_dtype: self.ae_dtype,
            diff_dtype: self.diff_dtype,
            loading_half_params: flag(self.loading_half_params),
            use_tile_vae: flag(self.use_tile_vae),
            encoder_tile_size: self.encoder_tile_size,
            decoder_tile_size: self.decoder_tile_size,
            use_fast_tile: flag(self.use_fast_tile),
            no_llava: flag(self.no_llava),
            load_8bit_llava: flag(self.load_8bit_llava),
            format: self.format,
            quality: self.quality,
            fail_fast: flag(self.fail_fast),
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("supir_batch={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match run(&args) {
        Ok(report) if report.total == 0 => {
            tracing::error!("No files found in {}", args.img_dir.display());
            ExitCode::from(EXIT_NO_OUTPUT)
        }
        Ok(report) if report.is_complete() => {
            println!("{report}");
            ExitCode::SUCCESS
        }
        Ok(report) => {
            for failure in &report.failures {
                eprintln!("skipped {}: {}", failure.input.display(), failure.reason);
            }
            println!("Partial batch: {report}");
            ExitCode::from(EXIT_PARTIAL)
        }
        Err(err) => {
            tracing::error!("{err:#}");
            match err.downcast_ref::<Error>() {
                Some(Error::BatchAborted { restored, total, .. }) if *restored > 0 => {
                    println!("Partial batch: {restored} of {total} images restored before abort");
                    ExitCode::from(EXIT_PARTIAL)
                }
                _ => {
                    println!("Stopped before any output was written");
                    ExitCode::from(EXIT_NO_OUTPUT)
                }
            }
        }
    }
}

fn run(args: &Args) -> Result<BatchReport> {
    if !args.img_dir.is_dir() {
        anyhow::bail!("Input directory does not exist: {}", args.img_dir.display());
    }

    let devices = probe_devices().context("Failed to enumerate accelerators")?;
    let devices = DeviceAssignment::from_devices(&devices)?;

    let profile = Profile::load(&args.options_dir, args.options)
        .context("Failed to load options profile")?;
    let config = Config::resolve(
        args.img_dir.clone(),
        args.save_dir.clone(),
        &profile,
        &args.overrides(),
    )
    .context("Invalid configuration")?;

    tracing::debug!("Resolved configuration: {config:#?}");
    tracing::info!(
        "Profile {} with SUPIR-{} and {}",
        config.profile,
        config.model.supir_sign,
        config.model.sampler_class()
    );
    if !config.model.no_llava {
        tracing::info!("Captioning is not run in batch mode; restoring with prompts only");
    }

    let checkpoint = ModelCache::new()?
        .resolve(profile.checkpoint(config.model.supir_sign)?)
        .context("Failed to resolve checkpoint")?;
    let model = OnnxRestorer::new(&checkpoint, config.model)?;

    let mut runner =
        BatchRunner::new(config, devices, model).context("Failed to initialize model")?;

    Ok(runner.run()?)
}
