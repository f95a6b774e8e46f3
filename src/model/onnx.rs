//! Restoration through an exported ONNX graph.
//!
//! The first graph input receives the low-quality image. Optional inputs are
//! matched by name and fed from the sampling configuration; anything else the
//! graph declares is left to its defaults.

use std::path::{Path, PathBuf};

use half::f16;
use ndarray::{s, Array1, Array4, Ix4};
use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};
use ort::session::{Session, SessionInputValue};
use ort::tensor::TensorElementType;
use ort::value::{Tensor, ValueType};
use rand::{Rng, SeedableRng};

use crate::config::{Dtype, ModelConfig, SamplingConfig, TileConfig, TILE_OVERLAP};
use crate::device::DeviceId;
use crate::error::{Error, Result};
use crate::image::{color_fix, tensor_hw, ImageTensor};

use super::{Placement, RestorationModel, RestoreRequest};

/// Optional graph inputs fed from the configuration.
const OPTIONAL_INPUTS: [&str; 10] = [
    "noise",
    "seed",
    "num_steps",
    "restoration_scale",
    "cfg_scale",
    "control_scale",
    "s_churn",
    "s_noise",
    "cfg_scale_start",
    "control_scale_start",
];

/// An ONNX restoration graph placed on a CUDA device.
pub struct OnnxRestorer {
    name: String,
    checkpoint: PathBuf,
    options: ModelConfig,
    loaded: Option<LoadedGraph>,
}

struct LoadedGraph {
    session: Session,
    image_input: String,
    output: String,
    optional_inputs: Vec<String>,
    half_io: bool,
}

impl OnnxRestorer {
    /// Prepare a restorer for `checkpoint`; the session is built on [`RestorationModel::place`].
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint file does not exist.
    pub fn new(checkpoint: &Path, options: ModelConfig) -> Result<Self> {
        if !checkpoint.is_file() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("checkpoint {} not found", checkpoint.display()),
            )));
        }

        let name = checkpoint
            .file_name()
            .map_or_else(|| "model".to_string(), |n| n.to_string_lossy().into_owned());

        Ok(Self {
            name,
            checkpoint: checkpoint.to_path_buf(),
            options,
            loaded: None,
        })
    }

    fn load_err(&self) -> impl Fn(ort::Error) -> Error + '_ {
        move |source| Error::ModelLoad {
            name: self.name.clone(),
            source,
        }
    }

    fn restore_one(
        &mut self,
        lq: &ImageTensor,
        sampling: &SamplingConfig,
        seed: u64,
    ) -> Result<ImageTensor> {
        let tile = self.options.tile;
        let loaded = self.loaded.as_mut().ok_or_else(|| Error::ModelNotPlaced {
            name: self.name.clone(),
        })?;

        let (height, width) = tensor_hw(lq);
        let tile_size = tile.encoder_tile_size as usize;
        if tile.enabled && (height > tile_size || width > tile_size) {
            run_tiled(lq, &tile, |input, origin| {
                loaded.run(input, sampling, tile_seed(seed, origin))
            })
        } else {
            loaded.run(lq, sampling, seed)
        }
    }
}

impl RestorationModel for OnnxRestorer {
    fn name(&self) -> &str {
        &self.name
    }

    fn placement(&self) -> Placement {
        Placement::Explicit
    }

    #[allow(clippy::cast_possible_wrap)]
    fn place(&mut self, device: DeviceId) -> Result<()> {
        tracing::info!("Loading {} onto {device}", self.name);

        let cuda = CUDAExecutionProvider::default().with_device_id(device.ordinal as i32);
        if !cuda.is_available().unwrap_or(false) {
            tracing::warn!("CUDA EP is not available; inference will fall back to CPU");
        }

        let session = Session::builder()
            .map_err(self.load_err())?
            .with_execution_providers([cuda.build()])
            .map_err(self.load_err())?
            .commit_from_file(&self.checkpoint)
            .map_err(self.load_err())?;

        let Some(image_input) = session.inputs().first().map(|i| i.name().to_string()) else {
            return Err(Error::ShapeMismatch {
                expected: "at least one graph input".to_string(),
                actual: "none".to_string(),
            });
        };
        let Some(output) = session.outputs().first().map(|o| o.name().to_string()) else {
            return Err(Error::ShapeMismatch {
                expected: "at least one graph output".to_string(),
                actual: "none".to_string(),
            });
        };

        let graph_half = matches!(
            session.inputs()[0].dtype(),
            ValueType::Tensor { ty: TensorElementType::Float16, .. }
        );

        let mut optional_inputs = Vec::new();
        for input in session.inputs().iter().skip(1) {
            let name = input.name();
            if OPTIONAL_INPUTS.contains(&name) {
                optional_inputs.push(name.to_string());
            } else {
                tracing::warn!("Graph input {name:?} is not recognised and will not be fed");
            }
        }

        let half_io = io_precision(&self.options, graph_half)?;
        let ignored = ignored_options(&self.options, graph_half);
        if !ignored.is_empty() {
            tracing::warn!("{} ignores: {}", self.name, ignored.join(", "));
        }

        tracing::debug!(
            "Graph IO: image={image_input} output={output} half={half_io} optional={optional_inputs:?}"
        );

        self.loaded = Some(LoadedGraph {
            session,
            image_input,
            output,
            optional_inputs,
            half_io,
        });

        tracing::info!("Model placed on {device}");
        Ok(())
    }

    fn restore(&mut self, lq: &ImageTensor, request: &RestoreRequest<'_>) -> Result<Vec<ImageTensor>> {
        let sampling = request.sampling;
        if !sampling.a_prompt.is_empty() || !request.captions.is_empty() {
            tracing::debug!("Prompts are not consumed by ONNX graphs");
        }

        let mut samples = Vec::with_capacity(sampling.num_samples as usize);
        for index in 0..sampling.num_samples {
            let seed = request.sample_seed(index);
            tracing::debug!("Sampling {}/{} with seed {seed}", index + 1, sampling.num_samples);

            let restored = self.restore_one(lq, sampling, seed)?;
            if restored.dim() != lq.dim() {
                return Err(Error::ShapeMismatch {
                    expected: format!("{:?}", lq.shape()),
                    actual: format!("{:?}", restored.shape()),
                });
            }

            samples.push(color_fix::apply(sampling.color_fix_type, &restored, lq));
        }

        Ok(samples)
    }
}

impl LoadedGraph {
    /// Run the graph once on a full image or a tile.
    fn run(&mut self, input: &ImageTensor, sampling: &SamplingConfig, seed: u64) -> Result<ImageTensor> {
        let mut inputs: Vec<(String, SessionInputValue<'static>)> =
            Vec::with_capacity(1 + self.optional_inputs.len());
        inputs.push((self.image_input.clone(), self.image_value(input.clone())?));

        for name in &self.optional_inputs {
            let value = match name.as_str() {
                "noise" => {
                    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
                    let noise = Array4::from_shape_fn(input.dim(), |_| {
                        rng.random::<f32>().mul_add(2.0, -1.0)
                    });
                    self.image_value(noise)?
                }
                #[allow(clippy::cast_possible_wrap)]
                "seed" => int_value(seed as i64)?,
                "num_steps" => int_value(i64::from(sampling.edm_steps))?,
                "restoration_scale" => float_value(sampling.s_stage1)?,
                "cfg_scale" => float_value(sampling.s_cfg)?,
                "control_scale" => float_value(sampling.s_stage2)?,
                "s_churn" => float_value(sampling.s_churn)?,
                "s_noise" => float_value(sampling.s_noise)?,
                "cfg_scale_start" => float_value(if sampling.linear_cfg {
                    sampling.spt_linear_cfg
                } else {
                    sampling.s_cfg
                })?,
                "control_scale_start" => float_value(if sampling.linear_s_stage2 {
                    sampling.spt_linear_s_stage2
                } else {
                    sampling.s_stage2
                })?,
                _ => continue,
            };
            inputs.push((name.clone(), value));
        }

        let outputs = self
            .session
            .run(inputs)
            .map_err(|source| Error::Inference { source })?;
        let output = &outputs[self.output.as_str()];

        let array = match output.try_extract_array::<f32>() {
            Ok(view) => view.to_owned(),
            Err(_) => output
                .try_extract_array::<f16>()
                .map_err(|source| Error::Inference { source })?
                .mapv(f32::from),
        };

        let shape = array.shape().to_vec();
        array
            .into_dimensionality::<Ix4>()
            .map_err(|_| Error::ShapeMismatch {
                expected: "4D tensor".to_string(),
                actual: format!("{shape:?}"),
            })
    }

    fn image_value(&self, array: Array4<f32>) -> Result<SessionInputValue<'static>> {
        let value: SessionInputValue<'static> = if self.half_io {
            Tensor::from_array(array.mapv(f16::from_f32))
                .map_err(|source| Error::Inference { source })?
                .into()
        } else {
            Tensor::from_array(array)
                .map_err(|source| Error::Inference { source })?
                .into()
        };
        Ok(value)
    }
}

/// Decide the IO precision from the requested dtypes and the graph's declared input.
///
/// An explicit request that contradicts the graph is a configuration error.
fn io_precision(options: &ModelConfig, graph_half: bool) -> Result<bool> {
    if graph_half && options.diff_dtype == Dtype::Fp32 {
        return Err(Error::invalid(
            "diff_dtype",
            "fp32 was requested but the graph declares fp16 input",
        ));
    }
    if !graph_half && options.loading_half_params {
        return Err(Error::invalid(
            "loading_half_params",
            "half precision was requested but the graph declares fp32 input",
        ));
    }
    Ok(graph_half)
}

/// Requested options this adapter cannot apply to an exported graph.
fn ignored_options(options: &ModelConfig, graph_half: bool) -> Vec<String> {
    let mut ignored = Vec::new();
    if !graph_half && options.diff_dtype.is_half() {
        ignored.push(format!("diff_dtype {} (graph declares fp32 input)", options.diff_dtype));
    }
    if options.ae_dtype != Dtype::Fp32 {
        ignored.push(format!("ae_dtype {} (autoencoder precision is fixed at export)", options.ae_dtype));
    }
    if options.tile.enabled && options.tile.decoder_tile_size != options.tile.encoder_tile_size {
        ignored.push(format!(
            "decoder_tile_size {} (tiles follow encoder_tile_size {})",
            options.tile.decoder_tile_size, options.tile.encoder_tile_size
        ));
    }
    if options.load_8bit_llava {
        ignored.push("load_8bit_llava (no captioning model is loaded)".to_string());
    }
    ignored
}

/// Seed for the tile whose top-left corner is `origin`; the first tile keeps `seed`.
fn tile_seed(seed: u64, (y, x): (usize, usize)) -> u64 {
    let origin = ((y as u64) << 32) | (x as u64 & 0xFFFF_FFFF);
    seed ^ origin.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

fn int_value(value: i64) -> Result<SessionInputValue<'static>> {
    Ok(Tensor::from_array(Array1::from_vec(vec![value]))
        .map_err(|source| Error::Inference { source })?
        .into())
}

fn float_value(value: f32) -> Result<SessionInputValue<'static>> {
    Ok(Tensor::from_array(Array1::from_vec(vec![value]))
        .map_err(|source| Error::Inference { source })?
        .into())
}

/// A tile: the region fed to the graph and the core written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TileSpan {
    start: usize,
    end: usize,
    core_start: usize,
    core_end: usize,
}

/// Split `len` into cores of `step` pixels, each padded by `overlap` on both sides.
fn tile_spans(len: usize, step: usize, overlap: usize) -> Vec<TileSpan> {
    let mut spans = Vec::new();
    let mut core_start = 0;
    while core_start < len {
        let core_end = (core_start + step).min(len);
        spans.push(TileSpan {
            start: core_start.saturating_sub(overlap),
            end: (core_end + overlap).min(len),
            core_start,
            core_end,
        });
        core_start = core_end;
    }
    spans
}

/// Restore `lq` tile by tile and stitch the tile cores back together.
///
/// `run` receives each padded tile and its top-left corner `(y, x)`.
fn run_tiled<F>(lq: &ImageTensor, tile: &TileConfig, mut run: F) -> Result<ImageTensor>
where
    F: FnMut(&ImageTensor, (usize, usize)) -> Result<ImageTensor>,
{
    let tile_size = tile.encoder_tile_size as usize;
    let overlap = if tile.fast { 0 } else { TILE_OVERLAP as usize };
    let step = tile_size.saturating_sub(overlap * 2);
    if step == 0 {
        return Err(Error::invalid(
            "encoder_tile_size",
            format!("{tile_size} is too small for overlap {overlap}"),
        ));
    }

    let (height, width) = tensor_hw(lq);
    let rows = tile_spans(height, step, overlap);
    let cols = tile_spans(width, step, overlap);
    tracing::debug!(
        "Tiled restoration: {}x{} tiles of {tile_size}px (overlap {overlap})",
        rows.len(),
        cols.len()
    );

    let mut output = Array4::<f32>::zeros(lq.raw_dim());
    for row in &rows {
        for col in &cols {
            let input = lq
                .slice(s![.., .., row.start..row.end, col.start..col.end])
                .to_owned();
            let restored = run(&input, (row.start, col.start))?;
            if restored.dim() != input.dim() {
                return Err(Error::ShapeMismatch {
                    expected: format!("{:?}", input.shape()),
                    actual: format!("{:?}", restored.shape()),
                });
            }

            let (y0, y1) = (row.core_start - row.start, row.core_end - row.start);
            let (x0, x1) = (col.core_start - col.start, col.core_end - col.start);
            output
                .slice_mut(s![.., .., row.core_start..row.core_end, col.core_start..col.core_end])
                .assign(&restored.slice(s![.., .., y0..y1, x0..x1]));
        }
    }

    Ok(output)
}
