use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use dictation_onboarding::config::Config;
use dictation_onboarding::models::{HttpModelDownloader, ModelDownloads};
use dictation_onboarding::operation::{OperationState, Registry, RunOutcome};
use dictation_onboarding::permissions::{Permission, PermissionOnboarding, SystemPermission};
use dictation_onboarding::poll::PollOutcome;
use dictation_onboarding::settings::{SettingsPersister, TomlSettingsStore};
use dictation_onboarding::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    telemetry::init(config.telemetry.enabled, &config.telemetry.log_path)?;
    tracing::info!("dictation-onboarding starting");

    // Settings
    let store = Arc::new(TomlSettingsStore::new(Config::expand_path(
        &config.settings.path,
    )?));
    let persister = SettingsPersister::new(store, config.settings.debounce())?;
    let mut settings = persister.load().context("failed to load settings")?;
    tracing::info!(
        language = %settings.language,
        model = %settings.model,
        onboarding_complete = settings.onboarding_complete,
        "settings loaded"
    );

    // Permissions
    let permission_registry = Registry::<()>::new()?;
    let onboarding = PermissionOnboarding::new(permission_registry.clone(), config.permissions.clone());
    let mut all_granted = true;
    for permission in Permission::ALL {
        all_granted &= ensure_permission(&onboarding, permission).await?;
    }

    // Models
    let model_registry = Registry::<PathBuf>::new()?;
    let downloads = ModelDownloads::new(
        model_registry.clone(),
        Arc::new(HttpModelDownloader::new(&config.models)?),
    );
    let mut events = downloads.subscribe();
    let watcher = tokio::spawn(async move {
        while let Some(transition) = events.next().await {
            match transition.state {
                OperationState::Running { progress: Some(progress) } => {
                    tracing::debug!(language = %transition.key, progress, "model download progress");
                }
                OperationState::Succeeded(path) => {
                    tracing::info!(language = %transition.key, path = %path.display(), "model ready");
                }
                OperationState::Failed(failure) => {
                    tracing::warn!(language = %transition.key, reason = %failure, "model download failed");
                }
                OperationState::Idle | OperationState::Running { .. } => {}
            }
        }
    });

    let handles = config
        .models
        .languages
        .iter()
        .map(|language| downloads.start(language.as_str()))
        .collect::<Result<Vec<_>, _>>()?;

    let models_ready = tokio::select! {
        ready = async {
            let mut ready = true;
            for handle in handles {
                let language = handle.key().to_owned();
                if !matches!(handle.outcome().await, RunOutcome::Succeeded(_)) {
                    tracing::warn!(language = %language, "model not available");
                    ready = false;
                }
            }
            ready
        } => ready,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received during model downloads");
            false
        }
    };

    if all_granted && models_ready && !settings.onboarding_complete {
        settings.onboarding_complete = true;
        persister.update(settings)?;
        tracing::info!("onboarding complete");
    }

    // Shutdown
    model_registry.shutdown();
    permission_registry.shutdown();
    persister.shutdown().await;
    watcher.abort();
    tracing::info!("dictation-onboarding stopped");

    Ok(())
}

/// Requests `permission` and, if denied, waits for the user to grant it
async fn ensure_permission(onboarding: &PermissionOnboarding, permission: Permission) -> Result<bool> {
    let provider = Arc::new(SystemPermission::new(permission));
    match onboarding.request(permission, provider.clone())?.outcome().await {
        RunOutcome::Succeeded(()) => {
            tracing::info!(permission = %permission, "permission granted");
            return Ok(true);
        }
        RunOutcome::Failed(failure) => {
            tracing::info!(
                permission = %permission,
                reason = %failure,
                pane = permission.settings_pane(),
                "permission not granted yet, waiting"
            );
        }
        RunOutcome::Cancelled => return Ok(false),
    }

    let outcome = onboarding.await_grant(permission, provider)?.wait().await;
    match outcome {
        PollOutcome::Satisfied(()) => Ok(true),
        PollOutcome::TimedOut => {
            tracing::warn!(
                permission = %permission,
                deadline_secs = onboarding.deadline(permission).as_secs(),
                "timed out waiting for permission"
            );
            Ok(false)
        }
        PollOutcome::Cancelled => Ok(false),
        PollOutcome::Failed(failure) => {
            tracing::warn!(permission = %permission, reason = %failure, "permission check failed");
            Ok(false)
        }
    }
}
