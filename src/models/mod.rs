use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::operation::{
    Failure, OperationState, Registry, RegistryError, RunContext, RunHandle, Subscription,
};

/// Model download providers
pub mod download;

pub use download::{DownloadProvider, HttpModelDownloader};

/// Tracks per-language model downloads as keyed operations
///
/// Each language code is its own key: downloads for different languages run
/// side by side, and starting a language again restarts only that download.
pub struct ModelDownloads {
    registry: Registry<PathBuf>,
    provider: Arc<dyn DownloadProvider>,
}

impl ModelDownloads {
    /// Runs downloads from `provider` in `registry`
    #[must_use]
    pub fn new(registry: Registry<PathBuf>, provider: Arc<dyn DownloadProvider>) -> Self {
        Self { registry, provider }
    }

    /// Starts (or restarts) the download for `language`
    ///
    /// # Errors
    /// Returns error if `language` is empty or the registry was shut down
    pub fn start(&self, language: &str) -> Result<RunHandle<PathBuf>, RegistryError> {
        let provider = Arc::clone(&self.provider);
        self.registry.start(language, move |ctx| download(ctx, provider))
    }

    /// Starts the download for `language` again after a failure
    ///
    /// # Errors
    /// Returns error if `language` is empty or the registry was shut down
    pub fn retry(&self, language: &str) -> Result<RunHandle<PathBuf>, RegistryError> {
        let provider = Arc::clone(&self.provider);
        self.registry.retry(language, move |ctx| download(ctx, provider))
    }

    /// Stops the download for `language`
    pub fn cancel(&self, language: &str) -> bool {
        self.registry.cancel(language)
    }

    /// Current state for `language`
    #[must_use]
    pub fn state(&self, language: &str) -> OperationState<PathBuf> {
        self.registry.snapshot(language)
    }

    /// Observes progress and completion for every language
    #[must_use]
    pub fn subscribe(&self) -> Subscription<PathBuf> {
        self.registry.subscribe()
    }
}

async fn download(
    ctx: RunContext<PathBuf>,
    provider: Arc<dyn DownloadProvider>,
) -> Result<PathBuf, Failure> {
    let language = ctx.key().to_owned();
    let token = ctx.token().clone();
    info!(language = %language, "model download started");

    tokio::task::spawn_blocking(move || {
        provider.download(&language, &token, &mut |progress| {
            ctx.report_progress(progress);
        })
    })
    .await
    .map_err(|_| Failure::internal())?
}
