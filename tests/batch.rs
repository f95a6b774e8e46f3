//! End-to-end batch runs against stub restoration models.

use std::fs;
use std::path::Path;

use image::{Rgb, RgbImage};
use supir_batch::config::Config;
use supir_batch::device::{DeviceAssignment, DeviceId};
use supir_batch::image::ImageTensor;
use supir_batch::{BatchRunner, Error, Placement, RestorationModel, RestoreRequest, Result};

/// Returns the input unchanged once per requested sample and records what it saw.
#[derive(Default)]
struct EchoModel {
    placement: Option<Placement>,
    placed_on: Vec<DeviceId>,
    seen: Vec<[usize; 4]>,
    fail_on_call: Option<usize>,
}

impl RestorationModel for EchoModel {
    fn name(&self) -> &str {
        "echo"
    }

    fn placement(&self) -> Placement {
        self.placement.unwrap_or(Placement::Implicit)
    }

    fn place(&mut self, device: DeviceId) -> Result<()> {
        self.placed_on.push(device);
        Ok(())
    }

    fn restore(&mut self, lq: &ImageTensor, request: &RestoreRequest<'_>) -> Result<Vec<ImageTensor>> {
        let call = self.seen.len();
        let (n, c, h, w) = lq.dim();
        self.seen.push([n, c, h, w]);

        if self.fail_on_call == Some(call) {
            return Err(Error::ShapeMismatch {
                expected: "echo".to_string(),
                actual: "failure".to_string(),
            });
        }

        Ok(vec![lq.clone(); request.sampling.num_samples as usize])
    }
}

/// Returns one well-formed sample followed by one with a single channel.
struct RaggedModel;

impl RestorationModel for RaggedModel {
    fn name(&self) -> &str {
        "ragged"
    }

    fn restore(&mut self, lq: &ImageTensor, _request: &RestoreRequest<'_>) -> Result<Vec<ImageTensor>> {
        let (n, _, h, w) = lq.dim();
        Ok(vec![lq.clone(), ImageTensor::zeros((n, 1, h, w))])
    }
}

fn write_rgb(path: &Path, width: u32, height: u32) {
    RgbImage::from_pixel(width, height, Rgb([128, 64, 200]))
        .save(path)
        .unwrap();
}

fn small_config(img_dir: &Path, save_dir: &Path) -> Config {
    let mut config = Config::default();
    config.img_dir = img_dir.to_path_buf();
    config.save_dir = save_dir.to_path_buf();
    config.preprocess.min_size = 64;
    config
}

fn single_device() -> DeviceAssignment {
    DeviceAssignment::from_count(1).unwrap()
}

fn sorted_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn test_single_image_reaches_model_at_target_size() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_rgb(&input.path().join("photo.png"), 100, 100);

    let mut config = small_config(input.path(), &output.path().join("restored"));
    config.preprocess.upscale = 2;
    config.preprocess.min_size = 1024;
    config.preprocess.unit_resolution = 32;

    let mut model = EchoModel::default();
    let mut runner = BatchRunner::new(config, single_device(), &mut model).unwrap();
    let report = runner.run().unwrap();

    assert!(report.is_complete());
    assert_eq!(report.total, 1);
    let [n, c, h, w] = model.seen[0];
    assert_eq!((n, c), (1, 3));
    assert!(h >= 1024 && h % 32 == 0);
    assert!(w >= 1024 && w % 32 == 0);

    let written = &report.restored[0].outputs;
    assert_eq!(written.len(), 1);
    let restored = image::open(&written[0]).unwrap();
    assert!(restored.width() >= 1024 && restored.width() % 32 == 0);
    assert!(restored.height() >= 1024 && restored.height() % 32 == 0);
}

#[test]
fn test_model_sees_nchw_tensor() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_rgb(&input.path().join("wide.png"), 90, 40);

    let mut model = EchoModel::default();
    let config = small_config(input.path(), output.path());
    BatchRunner::new(config, single_device(), &mut model)
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(model.seen.len(), 1);
    let [n, c, h, w] = model.seen[0];
    assert_eq!((n, c), (1, 3));
    assert!(h >= 64 && w >= 64);
    assert_eq!(h % 32, 0);
    assert_eq!(w % 32, 0);
    assert!(w > h);
}

#[test]
fn test_one_file_per_sample() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_rgb(&input.path().join("cat.png"), 32, 32);

    let mut config = small_config(input.path(), output.path());
    config.sampling.num_samples = 2;

    let mut runner = BatchRunner::new(config, single_device(), EchoModel::default()).unwrap();
    let report = runner.run().unwrap();

    assert_eq!(report.output_count(), 2);
    assert_eq!(sorted_names(output.path()), ["cat_0.png", "cat_1.png"]);
}

#[test]
fn test_jpeg_output_extension() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_rgb(&input.path().join("dog.png"), 32, 32);

    let mut config = small_config(input.path(), output.path());
    config.output.format = supir_batch::config::OutputFormat::Jpg;

    let mut runner = BatchRunner::new(config, single_device(), EchoModel::default()).unwrap();
    runner.run().unwrap();

    assert_eq!(sorted_names(output.path()), ["dog_0.jpg"]);
}

#[test]
fn test_undecodable_file_is_skipped() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_rgb(&input.path().join("a.png"), 32, 32);
    fs::write(input.path().join("b.png"), b"definitely not a png").unwrap();
    write_rgb(&input.path().join("c.png"), 32, 32);

    let config = small_config(input.path(), output.path());
    let mut runner = BatchRunner::new(config, single_device(), EchoModel::default()).unwrap();
    let report = runner.run().unwrap();

    assert_eq!(report.total, 3);
    assert_eq!(report.restored.len(), 2);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].input.ends_with("b.png"));
    assert!(report.failures[0].reason.contains("b.png"));
    assert!(!report.is_complete());
    assert_eq!(sorted_names(output.path()), ["a_0.png", "c_0.png"]);
}

#[test]
fn test_inference_failure_is_skipped() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_rgb(&input.path().join("a.png"), 32, 32);
    write_rgb(&input.path().join("b.png"), 32, 32);

    let model = EchoModel {
        fail_on_call: Some(0),
        ..EchoModel::default()
    };
    let config = small_config(input.path(), output.path());
    let mut runner = BatchRunner::new(config, single_device(), model).unwrap();
    let report = runner.run().unwrap();

    assert_eq!(report.restored.len(), 1);
    assert!(report.failures[0].input.ends_with("a.png"));
    assert_eq!(sorted_names(output.path()), ["b_0.png"]);
}

#[test]
fn test_fail_fast_aborts_on_first_error() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_rgb(&input.path().join("a.png"), 32, 32);
    fs::write(input.path().join("b.png"), b"garbage").unwrap();
    write_rgb(&input.path().join("c.png"), 32, 32);

    let mut config = small_config(input.path(), output.path());
    config.fail_fast = true;

    let mut runner = BatchRunner::new(config, single_device(), EchoModel::default()).unwrap();
    let err = runner.run().unwrap_err();

    match err {
        Error::BatchAborted {
            restored,
            total,
            source,
        } => {
            assert_eq!(restored, 1);
            assert_eq!(total, 3);
            assert!(matches!(*source, Error::ImageLoad { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(sorted_names(output.path()), ["a_0.png"]);
}

#[test]
fn test_save_failure_aborts_batch() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_rgb(&input.path().join("a.png"), 32, 32);
    write_rgb(&input.path().join("b.png"), 32, 32);

    // A directory squatting on the output name makes the write fail.
    fs::create_dir(output.path().join("a_0.png")).unwrap();

    let config = small_config(input.path(), output.path());
    let mut runner = BatchRunner::new(config, single_device(), EchoModel::default()).unwrap();
    let err = runner.run().unwrap_err();

    assert!(matches!(
        err,
        Error::BatchAborted { restored: 0, total: 2, .. }
    ));
    assert!(!output.path().join("b_0.png").exists());
}

#[test]
fn test_two_devices_split_roles() {
    let output = tempfile::tempdir().unwrap();
    let model = EchoModel {
        placement: Some(Placement::Explicit),
        ..EchoModel::default()
    };
    let devices = DeviceAssignment::from_count(2).unwrap();
    let config = small_config(output.path(), output.path());

    let runner = BatchRunner::new(config, devices, model).unwrap();
    assert_eq!(runner.devices().primary, DeviceId::cuda(0));
    assert_eq!(runner.devices().auxiliary, DeviceId::cuda(1));
}

#[test]
fn test_placement_hook_called_once_for_explicit_only() {
    let output = tempfile::tempdir().unwrap();

    let mut explicit = EchoModel {
        placement: Some(Placement::Explicit),
        ..EchoModel::default()
    };
    let mut implicit = EchoModel::default();
    {
        let config = small_config(output.path(), output.path());
        let devices = DeviceAssignment::from_devices(&[DeviceId::cuda(3)]).unwrap();
        BatchRunner::new(config.clone(), devices, &mut explicit).unwrap();
        BatchRunner::new(config, devices, &mut implicit).unwrap();
    }

    assert_eq!(explicit.placed_on, [DeviceId::cuda(3)]);
    assert!(implicit.placed_on.is_empty());
}

#[test]
fn test_empty_input_directory() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();

    let config = small_config(input.path(), &output.path().join("new"));
    let mut runner = BatchRunner::new(config, single_device(), EchoModel::default()).unwrap();
    let report = runner.run().unwrap();

    assert_eq!(report.total, 0);
    assert!(output.path().join("new").is_dir());
}

#[test]
fn test_malformed_sample_writes_nothing_for_that_image() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_rgb(&input.path().join("a.png"), 32, 32);

    let mut config = small_config(input.path(), output.path());
    config.sampling.num_samples = 2;

    let mut runner = BatchRunner::new(config, single_device(), RaggedModel).unwrap();
    let report = runner.run().unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.output_count(), 0);
    assert!(sorted_names(output.path()).is_empty());
}
