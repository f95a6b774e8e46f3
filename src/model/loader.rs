//! Checkpoint resolution and downloading.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};

use crate::config::CheckpointSource;
use crate::error::{Error, Result};

/// Manages the checkpoint cache directory and downloads.
pub struct ModelCache {
    cache_dir: PathBuf,
}

impl ModelCache {
    /// Create a model cache in the platform cache directory.
    ///
    /// - Windows: `%LOCALAPPDATA%\supir-batch\models`
    /// - Linux: `~/.cache/supir-batch/models`
    /// - macOS: `~/Library/Caches/supir-batch/models`
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be created.
    pub fn new() -> Result<Self> {
        let base = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::with_dir(base.join("supir-batch").join("models"))
    }

    /// Create a model cache rooted at `cache_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn with_dir(cache_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&cache_dir)?;
        Ok(Self { cache_dir })
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Resolve a checkpoint to a local file, downloading it if necessary.
    ///
    /// An existing local `path` wins. Otherwise the file named after `path` (or
    /// the last URL segment) is looked up in the cache and fetched from `url`
    /// when missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint is missing and cannot be downloaded.
    pub fn resolve(&self, source: &CheckpointSource) -> Result<PathBuf> {
        if let Some(path) = source.path.as_ref().filter(|p| p.is_file()) {
            return Ok(path.clone());
        }

        let Some(url) = source.url.as_deref() else {
            let missing = source
                .path
                .as_ref()
                .map_or_else(|| "<unset>".to_string(), |p| p.display().to_string());
            return Err(Error::invalid(
                "checkpoint",
                format!("{missing} does not exist and no download url is configured"),
            ));
        };

        let file_name = cached_file_name(source, url);
        let cached = self.cache_dir.join(&file_name);
        if !cached.is_file() {
            download_file(url, &cached, &file_name)?;
        }

        Ok(cached)
    }
}

fn cached_file_name(source: &CheckpointSource, url: &str) -> String {
    source
        .path
        .as_ref()
        .and_then(|p| p.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .or_else(|| {
            url.split(['?', '#'])
                .next()
                .and_then(|u| u.rsplit('/').next())
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "checkpoint.onnx".to_string())
}

/// Download a file from a URL to a path with progress indication.
fn download_file(url: &str, path: &Path, name: &str) -> Result<()> {
    tracing::info!("Downloading {name} from {url}");

    let download_err = |source| Error::ModelDownload {
        name: name.to_string(),
        source,
    };

    let client = reqwest::blocking::Client::new();
    let mut response = client
        .get(url)
        .send()
        .and_then(reqwest::blocking::Response::error_for_status)
        .map_err(download_err)?;

    let pb = response
        .content_length()
        .map_or_else(ProgressBar::new_spinner, ProgressBar::new);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.set_message(format!("Downloading {name}"));

    // Write to a temporary file first, then rename for atomicity
    let temp_path = path.with_extension("part");
    let mut file = fs::File::create(&temp_path)?;

    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let bytes_read = response.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        file.write_all(&buffer[..bytes_read])?;
        pb.inc(bytes_read as u64);
    }
    file.sync_all()?;

    pb.finish_with_message(format!("Downloaded {name}"));

    fs::rename(&temp_path, path)?;

    Ok(())
}
