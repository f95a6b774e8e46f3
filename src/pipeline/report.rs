//! Outcome of a batch run.

use std::fmt;
use std::path::PathBuf;

/// An input that produced output files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredImage {
    pub input: PathBuf,
    pub outputs: Vec<PathBuf>,
}

/// An input that was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFailure {
    pub input: PathBuf,
    pub reason: String,
}

/// Per-image results of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Number of files found in the input directory.
    pub total: usize,
    pub restored: Vec<RestoredImage>,
    pub failures: Vec<ImageFailure>,
}

impl BatchReport {
    #[must_use]
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    pub(crate) fn record_success(&mut self, input: PathBuf, outputs: Vec<PathBuf>) {
        self.restored.push(RestoredImage { input, outputs });
    }

    pub(crate) fn record_failure(&mut self, input: PathBuf, reason: String) {
        self.failures.push(ImageFailure { input, reason });
    }

    /// Every input was restored.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.restored.len() == self.total
    }

    /// Total number of sample files written.
    #[must_use]
    pub fn output_count(&self) -> usize {
        self.restored.iter().map(|r| r.outputs.len()).sum()
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} images restored ({} samples written",
            self.restored.len(),
            self.total,
            self.output_count()
        )?;
        if !self.failures.is_empty() {
            write!(f, ", {} skipped", self.failures.len())?;
        }
        write!(f, ")")
    }
}
