use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::PermissionsConfig;
use crate::operation::{Failure, FailureKind, OperationState, Registry, RegistryError, RunHandle};
use crate::poll::{start_poll, PollHandle, PollSpec};

/// macOS privacy permissions the app needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    /// Audio capture
    Microphone,
    /// Text insertion into other apps
    Accessibility,
    /// Global hotkeys
    InputMonitoring,
}

impl Permission {
    /// Every permission, in onboarding order
    pub const ALL: [Self; 3] = [Self::Microphone, Self::Accessibility, Self::InputMonitoring];

    /// Operation key for this permission
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::Microphone => "microphone",
            Self::Accessibility => "accessibility",
            Self::InputMonitoring => "input-monitoring",
        }
    }

    /// Name of the System Settings pane that grants it
    #[must_use]
    pub const fn settings_pane(self) -> &'static str {
        match self {
            Self::Microphone => "Microphone",
            Self::Accessibility => "Accessibility",
            Self::InputMonitoring => "Input Monitoring",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// OS-level permission checks (mockable for tests)
#[cfg_attr(test, mockall::automock)]
pub trait PermissionProvider: Send + Sync {
    /// Returns true if access is currently granted
    fn check_granted(&self) -> bool;

    /// Asks the OS for access, prompting the user if needed
    ///
    /// # Errors
    /// Returns a [`FailureKind::Denied`] failure if access was not granted
    fn request_access(&self) -> Result<(), Failure>;
}

/// Checks permissions against the running system
#[derive(Debug, Clone, Copy)]
pub struct SystemPermission {
    permission: Permission,
}

impl SystemPermission {
    /// Provider for `permission`
    #[must_use]
    pub const fn new(permission: Permission) -> Self {
        Self { permission }
    }
}

impl PermissionProvider for SystemPermission {
    fn check_granted(&self) -> bool {
        match self.permission {
            Permission::Microphone => microphone_granted(),
            Permission::Accessibility => accessibility_granted(),
            Permission::InputMonitoring => input_monitoring_granted(),
        }
    }

    fn request_access(&self) -> Result<(), Failure> {
        info!(permission = %self.permission, "requesting permission");
        if self.check_granted() {
            info!(permission = %self.permission, "permission granted");
            return Ok(());
        }
        Err(Failure::new(
            FailureKind::Denied,
            format!(
                "{} permission denied - enable in System Settings > Privacy & Security > {}",
                self.permission.settings_pane(),
                self.permission.settings_pane()
            ),
        ))
    }
}

/// macOS prompts for the microphone on first capture, so there is nothing to check up front
fn microphone_granted() -> bool {
    tracing::debug!("microphone permission will be requested on first audio capture");
    true
}

#[cfg(target_os = "macos")]
fn accessibility_granted() -> bool {
    use core_graphics::event_source::{CGEventSource, CGEventSourceStateID};

    CGEventSource::new(CGEventSourceStateID::CombinedSessionState).is_ok()
}

#[cfg(target_os = "macos")]
fn input_monitoring_granted() -> bool {
    use core_graphics::event::CGEvent;
    use core_graphics::event_source::{CGEventSource, CGEventSourceStateID};

    // Creating an event from the HID source exercises the full permission chain
    CGEventSource::new(CGEventSourceStateID::HIDSystemState)
        .and_then(|source| CGEvent::new_keyboard_event(source, 0, true))
        .is_ok()
}

#[cfg(not(target_os = "macos"))]
const fn accessibility_granted() -> bool {
    true
}

#[cfg(not(target_os = "macos"))]
const fn input_monitoring_granted() -> bool {
    true
}

/// Acquires permissions as keyed operations: a one-shot request or a poll
/// that waits for the user to flip the switch in System Settings
pub struct PermissionOnboarding {
    registry: Registry<()>,
    config: PermissionsConfig,
}

impl PermissionOnboarding {
    /// Runs permission operations in `registry`
    #[must_use]
    pub const fn new(registry: Registry<()>, config: PermissionsConfig) -> Self {
        Self { registry, config }
    }

    /// Asks the OS for `permission` once
    ///
    /// # Errors
    /// Returns error if the registry was shut down
    pub fn request(
        &self,
        permission: Permission,
        provider: Arc<dyn PermissionProvider>,
    ) -> Result<RunHandle<()>, RegistryError> {
        self.registry.start(permission.key(), move |_ctx| async move {
            tokio::task::spawn_blocking(move || provider.request_access())
                .await
                .map_err(|_| Failure::internal())?
        })
    }

    /// Polls until `permission` is granted or its configured deadline passes
    ///
    /// # Errors
    /// Returns error if the registry was shut down
    pub fn await_grant(
        &self,
        permission: Permission,
        provider: Arc<dyn PermissionProvider>,
    ) -> Result<PollHandle<()>, RegistryError> {
        let spec = PollSpec::new(
            self.config.poll_interval(),
            self.deadline(permission),
            move || provider.check_granted(),
            move || info!(permission = %permission, "permission granted"),
        );
        start_poll(&self.registry, permission.key(), spec)
    }

    /// Stops whatever is in flight for `permission`
    pub fn cancel(&self, permission: Permission) -> bool {
        self.registry.cancel(permission.key())
    }

    /// Current state for `permission`
    #[must_use]
    pub fn state(&self, permission: Permission) -> OperationState<()> {
        self.registry.snapshot(permission.key())
    }

    /// How long to wait for `permission` before timing out
    #[must_use]
    pub const fn deadline(&self, permission: Permission) -> Duration {
        self.config.deadline(permission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::PollOutcome;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config() -> PermissionsConfig {
        PermissionsConfig {
            poll_interval_ms: 500,
            microphone_deadline_secs: 5,
            accessibility_deadline_secs: 60,
            input_monitoring_deadline_secs: 60,
        }
    }

    #[test]
    fn test_permission_keys_are_distinct() {
        let keys: std::collections::HashSet<_> = Permission::ALL.iter().map(|p| p.key()).collect();
        assert_eq!(keys.len(), Permission::ALL.len());
        assert_eq!(Permission::InputMonitoring.to_string(), "input-monitoring");
    }

    #[test]
    fn test_check_microphone_permission() {
        let provider = SystemPermission::new(Permission::Microphone);
        assert!(provider.check_granted());
        assert!(provider.request_access().is_ok());
    }

    #[test]
    #[ignore = "requires accessibility permissions on macOS"]
    fn test_check_accessibility_permission() {
        let provider = SystemPermission::new(Permission::Accessibility);
        assert!(provider.request_access().is_ok());
    }

    #[test]
    #[ignore = "requires Input Monitoring permission on macOS"]
    fn test_check_input_monitoring_permission() {
        let provider = SystemPermission::new(Permission::InputMonitoring);
        assert!(provider.request_access().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_grant_satisfied_after_user_enables() {
        let registry = Registry::new().unwrap();
        let onboarding = PermissionOnboarding::new(registry, test_config());
        let checks = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&checks);
        let mut provider = MockPermissionProvider::new();
        provider
            .expect_check_granted()
            .returning(move || counter.fetch_add(1, Ordering::SeqCst) >= 2);

        let handle = onboarding
            .await_grant(Permission::Accessibility, Arc::new(provider))
            .unwrap();

        assert_eq!(handle.wait().await, PollOutcome::Satisfied(()));
        assert_eq!(checks.load(Ordering::SeqCst), 3);
        assert_eq!(
            onboarding.state(Permission::Accessibility),
            OperationState::Succeeded(())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_grant_uses_per_permission_deadline() {
        let onboarding = PermissionOnboarding::new(Registry::new().unwrap(), test_config());
        let mut provider = MockPermissionProvider::new();
        provider.expect_check_granted().return_const(false);

        let start = tokio::time::Instant::now();
        let handle = onboarding
            .await_grant(Permission::Microphone, Arc::new(provider))
            .unwrap();

        assert_eq!(handle.wait().await, PollOutcome::TimedOut);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_request_denied_is_retryable_failure() {
        let onboarding = PermissionOnboarding::new(Registry::new().unwrap(), test_config());
        let mut provider = MockPermissionProvider::new();
        provider
            .expect_request_access()
            .times(1)
            .returning(|| Err(Failure::new(FailureKind::Denied, "denied by user")));

        let outcome = onboarding
            .request(Permission::InputMonitoring, Arc::new(provider))
            .unwrap()
            .outcome()
            .await;

        let expected = Failure::new(FailureKind::Denied, "denied by user");
        assert_eq!(outcome, crate::operation::RunOutcome::Failed(expected.clone()));
        assert_eq!(
            onboarding.state(Permission::InputMonitoring),
            OperationState::Failed(expected)
        );
        assert!(FailureKind::Denied.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_resets_to_idle() {
        let onboarding = PermissionOnboarding::new(Registry::new().unwrap(), test_config());
        let mut provider = MockPermissionProvider::new();
        provider.expect_check_granted().return_const(false);

        let handle = onboarding
            .await_grant(Permission::Accessibility, Arc::new(provider))
            .unwrap();
        assert!(onboarding.cancel(Permission::Accessibility));

        assert_eq!(handle.wait().await, PollOutcome::Cancelled);
        assert_eq!(onboarding.state(Permission::Accessibility), OperationState::Idle);
        assert!(!onboarding.cancel(Permission::Accessibility));
    }
}
