use std::fmt;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::operation::{Failure, FailureKind, Registry, RegistryError, RunHandle, RunOutcome};

/// Repeatedly checks a condition until it holds or a deadline passes
pub struct PollSpec<T> {
    interval: Duration,
    deadline: Duration,
    predicate: Box<dyn FnMut() -> bool + Send>,
    on_satisfied: Box<dyn FnOnce() -> T + Send>,
}

impl<T> PollSpec<T> {
    /// Checks `predicate` every `interval` until it returns true or `deadline`
    /// elapses.
    ///
    /// `on_satisfied` runs at most once, after the first successful check, and
    /// its value becomes the operation's result. The predicate runs on the
    /// async worker, so it must be cheap and non-blocking.
    pub fn new(
        interval: Duration,
        deadline: Duration,
        predicate: impl FnMut() -> bool + Send + 'static,
        on_satisfied: impl FnOnce() -> T + Send + 'static,
    ) -> Self {
        Self {
            interval,
            deadline,
            predicate: Box::new(predicate),
            on_satisfied: Box::new(on_satisfied),
        }
    }

    /// Time between checks
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Time after which the poll gives up
    #[must_use]
    pub const fn deadline(&self) -> Duration {
        self.deadline
    }
}

impl<T> fmt::Debug for PollSpec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollSpec")
            .field("interval", &self.interval)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Terminal result of a poll as seen by the caller
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome<T> {
    /// The predicate held; carries the value from `on_satisfied`
    Satisfied(T),
    /// The deadline passed first; show the user how to fix it
    TimedOut,
    /// Cancelled or superseded; nothing to show
    Cancelled,
    /// The predicate or `on_satisfied` crashed
    Failed(Failure),
}

/// Awaitable handle for a poll started with [`start_poll`]
pub struct PollHandle<T> {
    run: RunHandle<T>,
}

impl<T> PollHandle<T> {
    /// Key the poll runs under
    #[must_use]
    pub fn key(&self) -> &str {
        self.run.key()
    }

    /// Waits for the poll to finish
    pub async fn wait(self) -> PollOutcome<T> {
        match self.run.outcome().await {
            RunOutcome::Succeeded(value) => PollOutcome::Satisfied(value),
            RunOutcome::Failed(failure) if failure.kind == FailureKind::TimedOut => {
                PollOutcome::TimedOut
            }
            RunOutcome::Failed(failure) => PollOutcome::Failed(failure),
            RunOutcome::Cancelled => PollOutcome::Cancelled,
        }
    }
}

/// Starts polling under `key` in `registry`
///
/// The poll is an ordinary operation: starting another one for the same key
/// cancels it, [`Registry::cancel`] stops it, and a timeout is recorded as
/// `Failed` with [`FailureKind::TimedOut`].
///
/// # Errors
/// Returns error if `key` is empty or the registry was shut down
pub fn start_poll<T>(
    registry: &Registry<T>,
    key: impl Into<String>,
    spec: PollSpec<T>,
) -> Result<PollHandle<T>, RegistryError>
where
    T: Clone + Send + Sync + 'static,
{
    let PollSpec {
        interval,
        deadline,
        mut predicate,
        on_satisfied,
    } = spec;

    let run = registry.start(key, move |ctx| async move {
        let started = Instant::now();
        let mut checks: u32 = 0;
        loop {
            if ctx.is_cancelled() {
                return Err(Failure::cancelled());
            }
            checks += 1;
            if predicate() {
                info!(key = ctx.key(), checks, "poll satisfied");
                return Ok(on_satisfied());
            }
            tokio::select! {
                () = ctx.cancelled() => return Err(Failure::cancelled()),
                () = sleep(interval) => {}
            }
            if started.elapsed() >= deadline {
                info!(key = ctx.key(), checks, "poll timed out");
                return Err(Failure::timed_out(ctx.key(), deadline));
            }
            debug!(key = ctx.key(), checks, "poll not yet satisfied");
        }
    })?;

    Ok(PollHandle { run })
}
