use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Machine-checkable category of a [`Failure`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Caller-initiated stop; recorded as `Idle`, never as `Failed`
    Cancelled,
    /// A poll reached its deadline without the predicate holding
    TimedOut,
    /// Access was refused (e.g. a permission prompt was declined)
    Denied,
    /// Remote fetch failed
    Network,
    /// Local read/write failed
    Storage,
    /// The work panicked or crashed unexpectedly
    Internal,
    /// Anything else reported by the work
    Other,
}

impl FailureKind {
    /// Whether retrying the same work can reasonably succeed
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed out",
            Self::Denied => "denied",
            Self::Network => "network",
            Self::Storage => "storage",
            Self::Internal => "internal",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Reason an operation did not succeed: a human-readable message plus a kind
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct Failure {
    /// Category callers can match on
    pub kind: FailureKind,
    /// Message suitable for showing to the user
    pub message: String,
}

impl Failure {
    /// Creates a failure of the given kind
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Failure recorded when work panics
    #[must_use]
    pub fn internal() -> Self {
        Self::new(FailureKind::Internal, "internal error")
    }

    /// Returned by work that observed its cancellation token
    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "cancelled")
    }

    /// Deadline exceeded while polling `key`
    #[must_use]
    pub fn timed_out(key: &str, deadline: Duration) -> Self {
        Self::new(
            FailureKind::TimedOut,
            format!(
                "timed out after {}s waiting for {key}; grant access in System Settings and try again",
                deadline.as_secs()
            ),
        )
    }
}

impl From<anyhow::Error> for Failure {
    fn from(err: anyhow::Error) -> Self {
        Self::new(FailureKind::Other, format!("{err:#}"))
    }
}

/// Current state of one keyed operation
#[derive(Debug, Clone, PartialEq)]
pub enum OperationState<T> {
    /// Never started, cancelled, or cleared
    Idle,
    /// In flight; `progress` is in `0.0..=1.0` and never decreases once set
    Running {
        /// Fraction complete, if the work reports it
        progress: Option<f64>,
    },
    /// Terminal success with the work's result
    Succeeded(T),
    /// Terminal failure with the work's reason
    Failed(Failure),
}

impl<T> OperationState<T> {
    /// Returns true for `Running`
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    /// Returns true for `Succeeded` and `Failed`
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded(_) | Self::Failed(_))
    }

    /// Reported progress while running
    #[must_use]
    pub const fn progress(&self) -> Option<f64> {
        match self {
            Self::Running { progress } => *progress,
            _ => None,
        }
    }
}

impl<T> Default for OperationState<T> {
    fn default() -> Self {
        Self::Idle
    }
}

/// How a single run ended, as seen by whoever started it
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome<T> {
    /// The run committed a success
    Succeeded(T),
    /// The run committed a failure
    Failed(Failure),
    /// The run was cancelled or superseded and committed nothing
    Cancelled,
}

/// Merges a newly reported progress value into the current one.
///
/// Values are clamped to `0.0..=1.0`, NaN is ignored, and progress never moves
/// backwards.
pub(crate) fn merge_progress(current: Option<f64>, reported: f64) -> Option<f64> {
    if reported.is_nan() {
        return current;
    }
    let reported = reported.clamp(0.0, 1.0);
    Some(current.map_or(reported, |prev| prev.max(reported)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_progress_monotonic() {
        assert_eq!(merge_progress(None, 0.3), Some(0.3));
        assert_eq!(merge_progress(Some(0.5), 0.2), Some(0.5));
        assert_eq!(merge_progress(Some(0.5), 0.7), Some(0.7));
    }

    #[test]
    fn test_merge_progress_clamps_and_ignores_nan() {
        assert_eq!(merge_progress(None, 1.5), Some(1.0));
        assert_eq!(merge_progress(None, -0.5), Some(0.0));
        assert_eq!(merge_progress(Some(0.4), f64::NAN), Some(0.4));
        assert_eq!(merge_progress(None, f64::NAN), None);
    }

    #[test]
    fn test_timed_out_message_is_actionable() {
        let failure = Failure::timed_out("accessibility", Duration::from_secs(60));
        assert_eq!(failure.kind, FailureKind::TimedOut);
        assert!(failure.message.contains("accessibility"));
        assert!(failure.message.contains("60s"));
        assert!(failure.message.contains("System Settings"));
    }

    #[test]
    fn test_failure_from_anyhow_keeps_context_chain() {
        let err = anyhow::anyhow!("connection refused").context("failed to fetch model");
        let failure = Failure::from(err);
        assert_eq!(failure.kind, FailureKind::Other);
        assert_eq!(failure.message, "failed to fetch model: connection refused");
    }

    #[test]
    fn test_state_predicates() {
        let running: OperationState<()> = OperationState::Running {
            progress: Some(0.25),
        };
        assert!(running.is_running());
        assert!(!running.is_terminal());
        assert_eq!(running.progress(), Some(0.25));

        let failed: OperationState<()> = OperationState::Failed(Failure::internal());
        assert!(failed.is_terminal());
        assert_eq!(failed.progress(), None);
        assert_eq!(OperationState::<()>::default(), OperationState::Idle);
    }

    #[test]
    fn test_cancelled_is_not_retryable() {
        assert!(!FailureKind::Cancelled.is_retryable());
        assert!(FailureKind::TimedOut.is_retryable());
        assert!(FailureKind::Network.is_retryable());
    }
}
