//! Batch restoration over a directory of images.

mod batch;
mod report;

pub use batch::{list_images, output_path, output_stem, BatchRunner};
pub use report::{BatchReport, ImageFailure, RestoredImage};
