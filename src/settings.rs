use serde::{Deserialize, Serialize};
use std::fs;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::debounce::Debouncer;
use crate::operation::{Failure, FailureKind, OperationState, RegistryError, RunOutcome};

/// Resource name settings writes are debounced under
pub const SETTINGS_RESOURCE: &str = "settings";

/// User-facing preferences edited in the settings window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Transcription language code
    pub language: String,
    /// Model size
    pub model: String,
    /// Push-to-talk hotkey
    pub hotkey: HotkeySettings,
    /// Start the app at login
    pub launch_at_login: bool,
    /// Play a sound when recording starts and stops
    pub play_sounds: bool,
    /// Hands-free activation
    pub wake_word: WakeWordSettings,
    /// Whether the onboarding flow has been completed
    pub onboarding_complete: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            language: "en".to_owned(),
            model: "base".to_owned(),
            hotkey: HotkeySettings::default(),
            launch_at_login: false,
            play_sounds: true,
            wake_word: WakeWordSettings::default(),
            onboarding_complete: false,
        }
    }
}

/// Push-to-talk key combination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotkeySettings {
    /// Modifier names, e.g. `Control`, `Option`
    pub modifiers: Vec<String>,
    /// Key name, e.g. `Z`
    pub key: String,
}

impl Default for HotkeySettings {
    fn default() -> Self {
        Self {
            modifiers: vec!["Control".to_owned(), "Option".to_owned()],
            key: "Z".to_owned(),
        }
    }
}

/// Wake word detection preferences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeWordSettings {
    /// Listen for the wake phrase
    pub enabled: bool,
    /// Phrase that starts recording
    pub phrase: String,
    /// Detection sensitivity in `0.0..=1.0`
    pub sensitivity: f32,
}

impl Default for WakeWordSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            phrase: "hey whisper".to_owned(),
            sensitivity: 0.5,
        }
    }
}

/// Errors reading or writing the settings file
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Settings file exists but could not be read
    #[error("failed to read settings from {path}: {source}")]
    Read {
        /// Settings file
        path: String,
        /// Underlying error
        source: io::Error,
    },

    /// Settings file is not valid TOML for [`Settings`]
    #[error("failed to parse settings at {path}: {source}")]
    Parse {
        /// Settings file
        path: String,
        /// Underlying error
        source: toml::de::Error,
    },

    /// Settings could not be encoded
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Settings file could not be written
    #[error("failed to write settings to {path}: {source}")]
    Write {
        /// Settings file
        path: String,
        /// Underlying error
        source: io::Error,
    },
}

impl From<SettingsError> for Failure {
    fn from(err: SettingsError) -> Self {
        Self::new(FailureKind::Storage, err.to_string())
    }
}

/// Settings storage (mockable for tests)
#[cfg_attr(test, mockall::automock)]
pub trait SettingsStore: Send + Sync {
    /// Reads settings, returning defaults if none were saved yet
    ///
    /// # Errors
    /// Returns error if stored settings exist but cannot be read
    fn load(&self) -> Result<Settings, SettingsError>;

    /// Replaces the stored settings
    ///
    /// # Errors
    /// Returns error if the settings cannot be written
    fn save(&self, settings: &Settings) -> Result<(), SettingsError>;
}

/// Stores settings as a TOML file, written atomically
#[derive(Debug, Clone)]
pub struct TomlSettingsStore {
    path: PathBuf,
}

impl TomlSettingsStore {
    /// Store backed by the file at `path`
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn display_path(&self) -> String {
        self.path.display().to_string()
    }
}

impl SettingsStore for TomlSettingsStore {
    fn load(&self) -> Result<Settings, SettingsError> {
        if !self.path.exists() {
            tracing::debug!(path = %self.path.display(), "no settings file, using defaults");
            return Ok(Settings::default());
        }
        let contents = fs::read_to_string(&self.path).map_err(|source| SettingsError::Read {
            path: self.display_path(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| SettingsError::Parse {
            path: self.display_path(),
            source,
        })
    }

    fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        let contents = toml::to_string_pretty(settings)?;
        let write_err = |source| SettingsError::Write {
            path: self.display_path(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        // Write to temporary file first so a crash never leaves a truncated file
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, contents).map_err(write_err)?;
        fs::rename(&temp_path, &self.path).map_err(write_err)?;

        tracing::debug!(path = %self.path.display(), "settings saved");
        Ok(())
    }
}

type CommitFuture = Pin<Box<dyn Future<Output = Result<(), Failure>> + Send>>;
type CommitFn = Box<dyn Fn(String, Settings) -> CommitFuture + Send + Sync>;

/// Writes settings changes through a debouncer
///
/// Rapid edits (e.g. dragging a slider) coalesce into one save of the latest
/// values. Pending edits are saved on [`SettingsPersister::shutdown`].
pub struct SettingsPersister {
    store: Arc<dyn SettingsStore>,
    debouncer: Debouncer<Settings, CommitFn>,
}

impl SettingsPersister {
    /// Saves to `store` once edits have been quiet for `quiet`
    ///
    /// # Errors
    /// Returns error when called outside a Tokio runtime
    pub fn new(store: Arc<dyn SettingsStore>, quiet: Duration) -> Result<Self, RegistryError> {
        let commit_store = Arc::clone(&store);
        let commit: CommitFn = Box::new(move |_resource, settings| {
            let store = Arc::clone(&commit_store);
            Box::pin(async move {
                tokio::task::spawn_blocking(move || store.save(&settings))
                    .await
                    .map_err(|_| Failure::internal())?
                    .map_err(Failure::from)
            })
        });
        Ok(Self {
            store,
            debouncer: Debouncer::new(quiet, commit)?,
        })
    }

    /// Reads the stored settings
    ///
    /// # Errors
    /// Returns error if stored settings exist but cannot be read
    pub fn load(&self) -> Result<Settings, SettingsError> {
        self.store.load()
    }

    /// Queues `settings` to be saved after the quiet period
    ///
    /// # Errors
    /// Returns error if the persister was shut down
    pub fn update(&self, settings: Settings) -> Result<(), RegistryError> {
        self.debouncer.request(SETTINGS_RESOURCE, settings)
    }

    /// Saves any pending change now
    ///
    /// # Errors
    /// Returns error if the persister was shut down
    pub async fn flush(&self) -> Result<Option<RunOutcome<()>>, RegistryError> {
        self.debouncer.flush(SETTINGS_RESOURCE).await
    }

    /// Drops pending edits and saves the defaults immediately
    ///
    /// # Errors
    /// Returns error if the persister was shut down or the save failed
    pub async fn reset(&self) -> Result<Settings, Failure> {
        if self.debouncer.discard(SETTINGS_RESOURCE) {
            info!("discarded pending settings change before reset");
        }
        let defaults = Settings::default();
        self.update(defaults.clone())
            .map_err(|err| Failure::new(FailureKind::Internal, err.to_string()))?;
        match self.flush().await {
            Ok(Some(RunOutcome::Succeeded(()))) => Ok(defaults),
            Ok(Some(RunOutcome::Failed(failure))) => Err(failure),
            Ok(Some(RunOutcome::Cancelled) | None) => Err(Failure::cancelled()),
            Err(err) => Err(Failure::new(FailureKind::Internal, err.to_string())),
        }
    }

    /// Whether an edit is waiting to be saved
    #[must_use]
    pub fn has_pending_changes(&self) -> bool {
        self.debouncer.is_pending(SETTINGS_RESOURCE)
    }

    /// State of the most recent save
    #[must_use]
    pub fn state(&self) -> OperationState<()> {
        self.debouncer.state(SETTINGS_RESOURCE)
    }

    /// Saves pending edits and stops accepting new ones
    pub async fn shutdown(&self) {
        let flushed = self.debouncer.shutdown().await;
        info!(flushed, "settings persister shut down");
    }
}
