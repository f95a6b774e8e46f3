//! Sequential restoration of every image in a directory.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};

use crate::config::{Config, OutputFormat};
use crate::device::DeviceAssignment;
use crate::error::{Error, Result};
use crate::image;
use crate::model::{Placement, RestorationModel, RestoreRequest};

use super::report::BatchReport;

/// Context for one batch run: configuration, devices, and the placed model.
pub struct BatchRunner<M> {
    config: Config,
    devices: DeviceAssignment,
    model: M,
}

impl<M: RestorationModel> BatchRunner<M> {
    /// Place `model` on the primary device when it requires explicit placement.
    ///
    /// # Errors
    ///
    /// Returns an error if placement fails.
    pub fn new(config: Config, devices: DeviceAssignment, mut model: M) -> Result<Self> {
        tracing::info!(
            "Devices: restoration on {}, captioning on {}",
            devices.primary,
            devices.auxiliary
        );

        match model.placement() {
            Placement::Explicit => model.place(devices.primary)?,
            Placement::Implicit => {
                tracing::debug!("{} manages its own placement", model.name());
            }
        }

        Ok(Self {
            config,
            devices,
            model,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn devices(&self) -> DeviceAssignment {
        self.devices
    }

    /// Restore every image under `img_dir` into `save_dir`.
    ///
    /// Recoverable per-image failures are recorded in the report and the loop
    /// continues, unless `fail_fast` is set. Any other failure aborts the batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the input directory cannot be listed, the output
    /// directory cannot be created, or the batch is aborted.
    pub fn run(&mut self) -> Result<BatchReport> {
        let inputs = list_images(&self.config.img_dir)?;
        fs::create_dir_all(&self.config.save_dir)?;

        tracing::info!(
            "Restoring {} file(s) from {} into {}",
            inputs.len(),
            self.config.img_dir.display(),
            self.config.save_dir.display()
        );

        let mut report = BatchReport::new(inputs.len());
        let mut stems = HashSet::new();

        let pb = ProgressBar::new(inputs.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} Restoring [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );

        for path in inputs {
            let stem = output_stem(&path);
            pb.set_message(stem.clone());
            if !stems.insert(stem.clone()) {
                tracing::warn!(
                    "{} shares the stem {stem:?} with an earlier file; its outputs will overwrite",
                    path.display()
                );
            }

            match self.process_image(&path, &stem) {
                Ok(outputs) => report.record_success(path, outputs),
                Err(err) if err.is_recoverable() && !self.config.fail_fast => {
                    tracing::warn!("Skipping {}: {err}", path.display());
                    report.record_failure(path, err.to_string());
                }
                Err(err) => {
                    pb.abandon();
                    return Err(Error::BatchAborted {
                        restored: report.restored.len(),
                        total: report.total,
                        source: Box::new(err),
                    });
                }
            }

            pb.inc(1);
        }

        pb.finish_and_clear();
        tracing::info!("{report}");
        Ok(report)
    }

    /// Preprocess, restore, and save one image. Returns the written paths.
    ///
    /// # Errors
    ///
    /// Returns an error if any stage fails.
    pub fn process_image(&mut self, path: &Path, stem: &str) -> Result<Vec<PathBuf>> {
        tracing::info!("Processing image: {stem}");

        let raw = image::load_image(path)?;
        let lq = image::normalize(&raw, &self.config.preprocess)?;

        let request = RestoreRequest::new(&self.config.sampling);
        let samples = self.model.restore(&lq, &request)?;
        if samples.len() != self.config.sampling.num_samples as usize {
            tracing::warn!(
                "{} returned {} samples, expected {}",
                self.model.name(),
                samples.len(),
                self.config.sampling.num_samples
            );
        }

        // Nothing is written unless every sample can be.
        if let Some(bad) = samples.iter().find(|sample| sample.dim() != lq.dim()) {
            return Err(Error::ShapeMismatch {
                expected: format!("{:?}", lq.shape()),
                actual: format!("{:?}", bad.shape()),
            });
        }

        let output = &self.config.output;
        let mut written = Vec::with_capacity(samples.len());
        for (index, sample) in samples.iter().enumerate() {
            let out_path = output_path(&self.config.save_dir, stem, index, output.format);
            image::save_image(sample, &out_path, output.format, output.quality)?;
            tracing::debug!("Saved {}", out_path.display());
            written.push(out_path);
        }

        Ok(written)
    }
}

/// Regular files directly under `dir`, sorted by file name.
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }

    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// File name without its extension.
#[must_use]
pub fn output_stem(path: &Path) -> String {
    path.file_stem()
        .map_or_else(String::new, |s| s.to_string_lossy().into_owned())
}

/// `<save_dir>/<stem>_<index>.<ext>`
#[must_use]
pub fn output_path(save_dir: &Path, stem: &str, index: usize, format: OutputFormat) -> PathBuf {
    save_dir.join(format!("{stem}_{index}.{}", format.extension()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_path() {
        assert_eq!(
            output_path(Path::new("out"), "cat", 1, OutputFormat::Png),
            Path::new("out/cat_1.png")
        );
        assert_eq!(
            output_path(Path::new("out"), "cat.v2", 0, OutputFormat::Jpg),
            Path::new("out/cat.v2_0.jpg")
        );
    }

    #[test]
    fn test_output_stem() {
        assert_eq!(output_stem(Path::new("in/photo.final.png")), "photo.final");
        assert_eq!(output_stem(Path::new("in/noext")), "noext");
    }

    #[test]
    fn test_list_images_sorted_and_flat() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["c.png", "a.png", "b.jpg"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("d.png"), b"x").unwrap();

        let files = list_images(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a.png", "b.jpg", "c.png"]);
    }

    #[test]
    fn test_list_images_missing_dir() {
        assert!(matches!(
            list_images(Path::new("/nonexistent/supir-batch-input")),
            Err(Error::Io(_))
        ));
    }
}
