use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::permissions::Permission;

/// Application configuration loaded from `~/.dictation-onboarding.toml`
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Permission polling
    pub permissions: PermissionsConfig,
    /// Model downloads
    pub models: ModelsConfig,
    /// Settings persistence
    pub settings: SettingsConfig,
    /// Logging
    pub telemetry: TelemetryConfig,
}

/// How permission grants are polled
#[derive(Debug, Deserialize, Clone)]
pub struct PermissionsConfig {
    /// Time between permission checks
    pub poll_interval_ms: u64,
    /// How long to wait for microphone access
    pub microphone_deadline_secs: u64,
    /// How long to wait for accessibility access
    pub accessibility_deadline_secs: u64,
    /// How long to wait for input monitoring access
    pub input_monitoring_deadline_secs: u64,
}

impl PermissionsConfig {
    /// Poll interval as a [`Duration`]
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Deadline for `permission`
    #[must_use]
    pub const fn deadline(&self, permission: Permission) -> Duration {
        let secs = match permission {
            Permission::Microphone => self.microphone_deadline_secs,
            Permission::Accessibility => self.accessibility_deadline_secs,
            Permission::InputMonitoring => self.input_monitoring_deadline_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Which models to fetch and from where
#[derive(Debug, Deserialize, Clone)]
pub struct ModelsConfig {
    /// Model size, e.g. `base` or `small`
    pub name: String,
    /// Directory models are stored in
    pub dir: String,
    /// URL the model files are fetched from
    pub base_url: String,
    /// Language codes to download models for
    pub languages: Vec<String>,
}

/// Where user settings live and how writes are coalesced
#[derive(Debug, Deserialize, Clone)]
pub struct SettingsConfig {
    /// Settings file
    pub path: String,
    /// Quiet period before a settings change is written
    pub debounce_ms: u64,
}

impl SettingsConfig {
    /// Debounce quiet period as a [`Duration`]
    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Logging destination
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    /// Log to a file instead of stdout
    pub enabled: bool,
    /// Log file path
    pub log_path: String,
}

const DEFAULT_CONFIG: &str = r#"[permissions]
poll_interval_ms = 500
microphone_deadline_secs = 5
accessibility_deadline_secs = 60
input_monitoring_deadline_secs = 60

[models]
name = "base"
dir = "~/.dictation-onboarding/models"
base_url = "https://huggingface.co/ggerganov/whisper.cpp/resolve/main"
languages = ["en"]

[settings]
path = "~/.dictation-onboarding/settings.toml"
debounce_ms = 500

[telemetry]
enabled = true
log_path = "~/.dictation-onboarding/onboarding.log"
"#;

impl Config {
    /// Load config from ~/.dictation-onboarding.toml
    ///
    /// # Errors
    /// Returns error if the file cannot be created, read, or parsed
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            Self::create_default(&config_path).context("failed to create default config")?;
        }

        Self::load_from(&config_path)
    }

    /// Load config from an explicit path
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).context("failed to read config file")?;
        Self::parse(&contents)
    }

    fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("failed to parse config TOML")
    }

    fn config_path() -> Result<PathBuf> {
        let home = std::env::var("HOME").context("HOME environment variable not set")?;
        Ok(PathBuf::from(home).join(".dictation-onboarding.toml"))
    }

    fn create_default(path: &Path) -> Result<()> {
        fs::write(path, DEFAULT_CONFIG).context("failed to write default config")?;
        Ok(())
    }

    /// Expand ~ in paths to home directory
    ///
    /// # Errors
    /// Returns error if the path starts with `~/` and HOME is not set
    pub fn expand_path(path: &str) -> Result<PathBuf> {
        if let Some(stripped) = path.strip_prefix("~/") {
            let home = std::env::var("HOME").context("HOME environment variable not set")?;
            Ok(PathBuf::from(home).join(stripped))
        } else {
            Ok(PathBuf::from(path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_parses() {
        let config = Config::parse(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.permissions.poll_interval(), Duration::from_millis(500));
        assert_eq!(
            config.permissions.deadline(Permission::Microphone),
            Duration::from_secs(5)
        );
        assert_eq!(
            config.permissions.deadline(Permission::Accessibility),
            Duration::from_secs(60)
        );
        assert_eq!(config.models.languages, vec!["en".to_owned()]);
        assert_eq!(config.settings.debounce(), Duration::from_millis(500));
        assert!(config.telemetry.enabled);
    }

    #[test]
    fn test_missing_section_is_error() {
        let result = Config::parse("[permissions]\npoll_interval_ms = 100\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, DEFAULT_CONFIG.replace("name = \"base\"", "name = \"small\"")).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.models.name, "small");
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let home = std::env::var("HOME").expect("HOME not set");
        let result = Config::expand_path("~/models/ggml-base.bin").unwrap();
        assert_eq!(result, PathBuf::from(home).join("models/ggml-base.bin"));
    }

    #[test]
    fn test_expand_path_without_tilde() {
        let result = Config::expand_path("/var/models/ggml-base.bin").unwrap();
        assert_eq!(result, PathBuf::from("/var/models/ggml-base.bin"));
    }
}
