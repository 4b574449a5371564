use anyhow::{bail, Context, Result};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::config::{Config, ModelsConfig};
use crate::operation::{CancelToken, Failure, FailureKind};

/// Bytes read from the response between progress reports and cancellation checks
const CHUNK_SIZE: usize = 256 * 1024;

/// Fetches a model for a language (mockable for tests)
pub trait DownloadProvider: Send + Sync {
    /// Downloads the model for `key`, calling `on_progress` with values in `0.0..=1.0`
    ///
    /// Blocking; checks `cancel` between chunks.
    ///
    /// # Errors
    /// Returns a failure describing why the model is not available
    fn download(
        &self,
        key: &str,
        cancel: &CancelToken,
        on_progress: &mut dyn FnMut(f64),
    ) -> Result<PathBuf, Failure>;
}

/// Maps a model name and language to its whisper.cpp filename
///
/// English gets the smaller English-only variant where one exists.
#[must_use]
pub fn model_filename(model_name: &str, language: &str) -> String {
    if language == "en" && !model_name.starts_with("large") {
        format!("ggml-{model_name}.en.bin")
    } else {
        format!("ggml-{model_name}.bin")
    }
}

/// Downloads models over HTTP into a local directory
#[derive(Debug, Clone)]
pub struct HttpModelDownloader {
    base_url: String,
    model_name: String,
    dir: PathBuf,
}

impl HttpModelDownloader {
    /// Creates a downloader from the `[models]` config section
    ///
    /// # Errors
    /// Returns error if the model directory cannot be expanded
    pub fn new(config: &ModelsConfig) -> Result<Self> {
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            model_name: config.name.clone(),
            dir: Config::expand_path(&config.dir)?,
        })
    }

    /// Where the model for `language` is stored
    #[must_use]
    pub fn model_path(&self, language: &str) -> PathBuf {
        self.dir.join(model_filename(&self.model_name, language))
    }

    /// Scratch file the download for `language` streams into
    ///
    /// Languages without an English-only variant share one model file, so the
    /// scratch file is per language and concurrent downloads never write into
    /// each other's data.
    #[must_use]
    pub fn temp_path(&self, language: &str) -> PathBuf {
        self.model_path(language)
            .with_extension(format!("{language}.tmp"))
    }

    fn fetch(
        &self,
        url: &str,
        model_path: &Path,
        temp_path: &Path,
        cancel: &CancelToken,
        on_progress: &mut dyn FnMut(f64),
    ) -> Result<()> {
        if let Some(parent) = model_path.parent() {
            fs::create_dir_all(parent).context("failed to create model directory")?;
        }

        tracing::info!(url = %url, "downloading model");

        let mut response = reqwest::blocking::get(url)
            .with_context(|| format!("failed to download model from {url}"))?;

        if !response.status().is_success() {
            bail!("download failed with status {}: {}", response.status(), url);
        }

        let total = response.content_length().filter(|len| *len > 0);
        let mut file = fs::File::create(temp_path)
            .with_context(|| format!("failed to create temp file at {}", temp_path.display()))?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut received: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                drop(file);
                let _ = fs::remove_file(temp_path);
                bail!("download cancelled");
            }
            let read = response
                .read(&mut buf)
                .context("failed to read response body")?;
            if read == 0 {
                break;
            }
            file.write_all(&buf[..read])
                .context("failed to write model to temp file")?;
            received += read as u64;
            if let Some(total) = total {
                on_progress(fraction(received, total));
            }
        }
        file.flush().context("failed to flush model file")?;

        // Drop file handle before rename
        drop(file);

        // Atomic rename - if this fails, temp file remains and is overwritten next attempt
        fs::rename(temp_path, model_path).with_context(|| {
            format!(
                "failed to rename {} to {}",
                temp_path.display(),
                model_path.display()
            )
        })?;

        tracing::info!(
            path = %model_path.display(),
            size = received,
            "model downloaded successfully"
        );
        Ok(())
    }
}

impl DownloadProvider for HttpModelDownloader {
    fn download(
        &self,
        key: &str,
        cancel: &CancelToken,
        on_progress: &mut dyn FnMut(f64),
    ) -> Result<PathBuf, Failure> {
        let model_path = self.model_path(key);
        if model_path.exists() {
            tracing::info!(
                path = %model_path.display(),
                "model already exists, skipping download"
            );
            on_progress(1.0);
            return Ok(model_path);
        }

        let url = format!(
            "{}/{}",
            self.base_url,
            model_filename(&self.model_name, key)
        );
        let temp_path = self.temp_path(key);
        match self.fetch(&url, &model_path, &temp_path, cancel, on_progress) {
            Ok(()) => Ok(model_path),
            Err(_) if cancel.is_cancelled() => Err(Failure::cancelled()),
            Err(err) => Err(Failure::new(FailureKind::Network, format!("{err:#}"))),
        }
    }
}

#[allow(clippy::cast_precision_loss)] // Model sizes are far below 2^52 bytes
fn fraction(received: u64, total: u64) -> f64 {
    (received as f64 / total as f64).min(1.0)
}
