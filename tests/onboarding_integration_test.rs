//! Integration tests for the onboarding flow
//!
//! These tests drive several features through the public API:
//! - Concurrent permission polls sharing one registry
//! - Cancellation and restart of individual keys
//! - Observers seeing every key's transitions
//! - Debounced settings writes landing on disk
//!
//! Timing-sensitive tests run with Tokio's paused clock.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dictation_onboarding::debounce::Debouncer;
use dictation_onboarding::operation::{
    Failure, FailureKind, OperationState, Registry, RegistryError, RunOutcome,
};
use dictation_onboarding::poll::{start_poll, PollOutcome, PollSpec};
use dictation_onboarding::settings::{Settings, SettingsPersister, SettingsStore, TomlSettingsStore};
use tokio::time::{sleep, Instant};

const INTERVAL: Duration = Duration::from_millis(500);

fn flag_poll(flag: &Arc<AtomicBool>, deadline: Duration) -> PollSpec<()> {
    let flag = Arc::clone(flag);
    PollSpec::new(INTERVAL, deadline, move || flag.load(Ordering::SeqCst), || ())
}

#[tokio::test(start_paused = true)]
async fn test_cancelling_one_poll_leaves_sibling_running() {
    let registry = Registry::<()>::new().unwrap();
    let mic_granted = Arc::new(AtomicBool::new(false));
    let ax_granted = Arc::new(AtomicBool::new(false));

    let mic = start_poll(
        &registry,
        "microphone",
        flag_poll(&mic_granted, Duration::from_secs(5)),
    )
    .unwrap();
    let ax = start_poll(
        &registry,
        "accessibility",
        flag_poll(&ax_granted, Duration::from_secs(60)),
    )
    .unwrap();

    sleep(Duration::from_secs(2)).await;
    assert!(registry.cancel("microphone"));
    assert_eq!(mic.wait().await, PollOutcome::Cancelled);

    assert_eq!(registry.snapshot("microphone"), OperationState::Idle);
    assert!(registry.snapshot("accessibility").is_running());

    sleep(Duration::from_secs(10)).await;
    ax_granted.store(true, Ordering::SeqCst);

    assert_eq!(ax.wait().await, PollOutcome::Satisfied(()));
    assert_eq!(registry.snapshot("accessibility"), OperationState::Succeeded(()));
    assert_eq!(registry.snapshot("microphone"), OperationState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_poll_can_be_retried() {
    let registry = Registry::<()>::new().unwrap();
    let granted = Arc::new(AtomicBool::new(false));
    let start = Instant::now();

    let first = start_poll(
        &registry,
        "microphone",
        flag_poll(&granted, Duration::from_secs(5)),
    )
    .unwrap();
    assert_eq!(first.wait().await, PollOutcome::TimedOut);
    assert!(start.elapsed() >= Duration::from_secs(5));
    assert!(matches!(
        registry.snapshot("microphone"),
        OperationState::Failed(ref failure) if failure.kind == FailureKind::TimedOut
    ));

    granted.store(true, Ordering::SeqCst);
    let second = start_poll(
        &registry,
        "microphone",
        flag_poll(&granted, Duration::from_secs(5)),
    )
    .unwrap();
    assert_eq!(second.wait().await, PollOutcome::Satisfied(()));
}

#[tokio::test(start_paused = true)]
async fn test_observer_sees_transitions_for_every_key() {
    let registry = Registry::<u32>::new().unwrap();
    let mut sub = registry.subscribe();

    let fast = registry.start("fast", |_ctx| async { Ok(1) }).unwrap();
    let slow = registry
        .start("slow", |_ctx| async {
            sleep(Duration::from_secs(1)).await;
            Err(Failure::new(FailureKind::Network, "offline"))
        })
        .unwrap();

    assert_eq!(fast.outcome().await, RunOutcome::Succeeded(1));
    assert!(matches!(slow.outcome().await, RunOutcome::Failed(_)));

    let mut seen = Vec::new();
    while let Some(transition) = sub.try_next() {
        seen.push((transition.key, transition.state));
    }
    assert_eq!(
        seen,
        vec![
            ("fast".to_owned(), OperationState::Running { progress: None }),
            ("slow".to_owned(), OperationState::Running { progress: None }),
            ("fast".to_owned(), OperationState::Succeeded(1)),
            (
                "slow".to_owned(),
                OperationState::Failed(Failure::new(FailureKind::Network, "offline"))
            ),
        ]
    );

    let latest = sub.latest();
    assert_eq!(latest.len(), 2);
    assert_eq!(latest.get("fast"), Some(&OperationState::Succeeded(1)));
}

#[tokio::test(start_paused = true)]
async fn test_restart_discards_stale_result() {
    let registry = Registry::<&'static str>::new().unwrap();

    let stale = registry
        .start("download", |_ctx| async {
            sleep(Duration::from_secs(3)).await;
            Ok("stale")
        })
        .unwrap();
    sleep(Duration::from_secs(1)).await;
    let fresh = registry
        .start("download", |_ctx| async {
            sleep(Duration::from_secs(1)).await;
            Ok("fresh")
        })
        .unwrap();

    assert_eq!(fresh.outcome().await, RunOutcome::Succeeded("fresh"));
    assert_eq!(stale.outcome().await, RunOutcome::Cancelled);

    sleep(Duration::from_secs(5)).await;
    assert_eq!(registry.snapshot("download"), OperationState::Succeeded("fresh"));
}

#[tokio::test(start_paused = true)]
async fn test_debouncer_coalesces_per_resource() {
    let commits = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&commits);
    let debouncer = Debouncer::new(INTERVAL, move |_resource: String, _payload: u32| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), Failure>(())
        }
    })
    .unwrap();

    for value in 0..10 {
        debouncer.request("volume", value).unwrap();
        debouncer.request("theme", value).unwrap();
        sleep(INTERVAL / 5).await;
    }
    sleep(INTERVAL * 2).await;

    assert_eq!(commits.load(Ordering::SeqCst), 2);
    assert_eq!(debouncer.state("volume"), OperationState::Succeeded(()));
    assert_eq!(debouncer.state("theme"), OperationState::Succeeded(()));
}

#[tokio::test]
async fn test_settings_persist_across_persisters() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.toml");

    let persister = SettingsPersister::new(
        Arc::new(TomlSettingsStore::new(path.clone())),
        Duration::from_secs(30),
    )
    .unwrap();
    let mut settings = persister.load().unwrap();
    settings.language = "nl".to_owned();
    settings.onboarding_complete = true;
    persister.update(settings.clone()).unwrap();
    persister.shutdown().await;

    assert!(matches!(
        persister.update(Settings::default()),
        Err(RegistryError::ShutDown)
    ));
    assert_eq!(TomlSettingsStore::new(path).load().unwrap(), settings);
}

#[tokio::test]
async fn test_shutdown_rejects_new_operations() {
    let registry = Registry::<()>::new().unwrap();
    let handle = registry
        .start("accessibility", |ctx| async move {
            ctx.cancelled().await;
            Err(Failure::cancelled())
        })
        .unwrap();

    registry.shutdown();

    assert_eq!(handle.outcome().await, RunOutcome::Cancelled);
    assert!(registry.is_shut_down());
    assert!(matches!(
        registry.start("accessibility", |_ctx| async { Ok(()) }),
        Err(RegistryError::ShutDown)
    ));
}
