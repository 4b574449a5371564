use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::cancel::CancelToken;
use super::observer::{Snapshot, Subscription, Transition};
use super::state::{merge_progress, Failure, FailureKind, OperationState, RunOutcome};

/// Buffered transitions per subscriber before the oldest are dropped
const EVENT_CAPACITY: usize = 256;

/// Errors returned when an operation cannot be started
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Operation keys must be non-empty
    #[error("operation key must not be empty")]
    EmptyKey,

    /// The registry was created outside a Tokio runtime
    #[error("no tokio runtime available to run operations")]
    NoRuntime,

    /// [`Registry::shutdown`] was called
    #[error("operation registry has been shut down")]
    ShutDown,
}

/// Bookkeeping for the run that currently owns a key
struct ActiveRun {
    id: u64,
    token: CancelToken,
    started_at: Instant,
}

/// One keyed operation as owned by the registry
struct Operation<T> {
    state: OperationState<T>,
    run: Option<ActiveRun>,
}

impl<T> Default for Operation<T> {
    fn default() -> Self {
        Self {
            state: OperationState::Idle,
            run: None,
        }
    }
}

struct Table<T> {
    ops: HashMap<String, Operation<T>>,
    closed: bool,
}

impl<T: Clone> Table<T> {
    fn state(&self, key: &str) -> OperationState<T> {
        self.ops
            .get(key)
            .map_or(OperationState::Idle, |op| op.state.clone())
    }

    fn snapshot(&self) -> Snapshot<T> {
        self.ops
            .iter()
            .map(|(key, op)| (key.clone(), op.state.clone()))
            .collect()
    }
}

struct Inner<T> {
    table: Mutex<Table<T>>,
    next_run_id: AtomicU64,
    root: CancelToken,
    events: broadcast::Sender<Transition<T>>,
    snapshots: watch::Sender<Snapshot<T>>,
    runtime: Handle,
}

impl<T: Clone + Send + Sync + 'static> Inner<T> {
    /// Every mutation replaces whole values under the lock, so a panic while it
    /// was held cannot leave a half-written entry behind.
    fn lock(&self) -> MutexGuard<'_, Table<T>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publishes the current state of `key`. Called with the table locked so
    /// observers see transitions in commit order.
    fn publish(&self, table: &Table<T>, key: &str) {
        let transition = Transition {
            key: key.to_owned(),
            state: table.state(key),
        };
        // No subscribers is fine
        let _ = self.events.send(transition);
        self.snapshots.send_replace(table.snapshot());
    }

    /// Records the result of run `run_id` if it still owns `key`.
    fn complete(&self, key: &str, run_id: u64, result: Result<T, Failure>) -> RunOutcome<T> {
        let mut table = self.lock();
        let Some(op) = table.ops.get_mut(key) else {
            return RunOutcome::Cancelled;
        };
        let Some(run) = op.run.take_if(|run| run.id == run_id) else {
            debug!(key, run_id, "discarding result of superseded run");
            return RunOutcome::Cancelled;
        };
        let elapsed_ms = run.started_at.elapsed().as_millis();

        let outcome = match result {
            Ok(value) => {
                info!(key, run_id, elapsed_ms, "operation succeeded");
                op.state = OperationState::Succeeded(value.clone());
                RunOutcome::Succeeded(value)
            }
            Err(failure) if failure.kind == FailureKind::Cancelled => {
                info!(key, run_id, elapsed_ms, "operation stopped itself");
                op.state = OperationState::Idle;
                RunOutcome::Cancelled
            }
            Err(failure) => {
                warn!(key, run_id, elapsed_ms, kind = %failure.kind, reason = %failure, "operation failed");
                op.state = OperationState::Failed(failure.clone());
                RunOutcome::Failed(failure)
            }
        };
        self.publish(&table, key);
        outcome
    }

    fn progress(&self, key: &str, run_id: u64, reported: f64) -> bool {
        let mut table = self.lock();
        let Some(op) = table.ops.get_mut(key) else {
            return false;
        };
        if op.run.as_ref().map(|run| run.id) != Some(run_id) {
            return false;
        }
        let OperationState::Running { progress } = op.state else {
            return false;
        };
        let merged = merge_progress(progress, reported);
        if merged == progress {
            return true;
        }
        op.state = OperationState::Running { progress: merged };
        self.publish(&table, key);
        true
    }
}

/// Handed to running work: its key, its cancellation token, and a way to
/// report progress that is ignored once the run no longer owns the key.
pub struct RunContext<T> {
    key: String,
    run_id: u64,
    token: CancelToken,
    registry: Weak<Inner<T>>,
}

impl<T> Clone for RunContext<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            run_id: self.run_id,
            token: self.token.clone(),
            registry: Weak::clone(&self.registry),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> RunContext<T> {
    /// Key this run was started for
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Identifier of this run, unique within the registry
    #[must_use]
    pub const fn run_id(&self) -> u64 {
        self.run_id
    }

    /// Cancellation token for this run
    #[must_use]
    pub const fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Shorthand for `self.token().is_cancelled()`
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once this run is cancelled or superseded
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Updates `Running { progress }` for this key.
    ///
    /// Returns false (and changes nothing) if the run was superseded or
    /// cancelled.
    pub fn report_progress(&self, value: f64) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|inner| inner.progress(&self.key, self.run_id, value))
    }
}

/// Awaitable result of one call to [`Registry::start`]
pub struct RunHandle<T> {
    key: String,
    run_id: u64,
    outcome: oneshot::Receiver<RunOutcome<T>>,
}

impl<T> RunHandle<T> {
    /// Key the run was started for
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Identifier of the run
    #[must_use]
    pub const fn run_id(&self) -> u64 {
        self.run_id
    }

    /// Waits until the run's work returns.
    ///
    /// A superseded or cancelled run resolves to [`RunOutcome::Cancelled`]
    /// whatever its work returned.
    pub async fn outcome(self) -> RunOutcome<T> {
        self.outcome.await.unwrap_or(RunOutcome::Cancelled)
    }
}

/// Owns every keyed operation and serializes their state transitions
///
/// Cloning is cheap and yields another handle to the same registry.
pub struct Registry<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Registry<T> {
    /// Creates a registry that spawns work on the current Tokio runtime
    ///
    /// # Errors
    /// Returns [`RegistryError::NoRuntime`] when called outside a runtime
    pub fn new() -> Result<Self, RegistryError> {
        let runtime = Handle::try_current().map_err(|_| RegistryError::NoRuntime)?;
        Ok(Self::with_runtime(runtime))
    }

    /// Creates a registry that spawns work on `runtime`
    #[must_use]
    pub fn with_runtime(runtime: Handle) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (snapshots, _) = watch::channel(HashMap::new());
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(Table {
                    ops: HashMap::new(),
                    closed: false,
                }),
                next_run_id: AtomicU64::new(1),
                root: CancelToken::new(),
                events,
                snapshots,
                runtime,
            }),
        }
    }

    /// Starts `work` for `key`, superseding any run already in flight for it
    ///
    /// The key is `Running` by the time this returns. The superseded run's
    /// token is cancelled and whatever it eventually returns is discarded.
    /// A panic inside `work` is recorded as `Failed("internal error")`.
    ///
    /// # Errors
    /// Returns error if `key` is empty or the registry was shut down
    pub fn start<F, Fut>(&self, key: impl Into<String>, work: F) -> Result<RunHandle<T>, RegistryError>
    where
        F: FnOnce(RunContext<T>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, Failure>> + Send + 'static,
    {
        let key = key.into();
        if key.is_empty() {
            return Err(RegistryError::EmptyKey);
        }

        let run_id = self.inner.next_run_id.fetch_add(1, Ordering::Relaxed);
        let token = self.inner.root.child_token();
        {
            let mut table = self.inner.lock();
            if table.closed {
                return Err(RegistryError::ShutDown);
            }
            let op = table.ops.entry(key.clone()).or_default();
            if let Some(previous) = op.run.take() {
                previous.token.cancel();
                debug!(key = %key, superseded = previous.id, "cancelled previous run");
            }
            op.run = Some(ActiveRun {
                id: run_id,
                token: token.clone(),
                started_at: Instant::now(),
            });
            op.state = OperationState::Running { progress: None };
            self.inner.publish(&table, &key);
        }
        info!(key = %key, run_id, "operation started");

        let ctx = RunContext {
            key: key.clone(),
            run_id,
            token,
            registry: Arc::downgrade(&self.inner),
        };
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();

        let job = self.inner.runtime.spawn(async move { work(ctx).await });
        self.inner.runtime.spawn(async move {
            let result = match job.await {
                Ok(result) => result,
                Err(err) if err.is_panic() => {
                    error!(key = %task_key, run_id, "operation panicked");
                    Err(Failure::internal())
                }
                Err(err) => {
                    warn!(key = %task_key, run_id, error = %err, "operation task aborted");
                    Err(Failure::cancelled())
                }
            };
            let outcome = inner.complete(&task_key, run_id, result);
            // The caller may have dropped its handle
            let _ = tx.send(outcome);
        });

        Ok(RunHandle {
            key,
            run_id,
            outcome: rx,
        })
    }

    /// Starts `work` again for a key, typically after it `Failed`
    ///
    /// # Errors
    /// Same as [`Registry::start`]
    pub fn retry<F, Fut>(&self, key: impl Into<String>, work: F) -> Result<RunHandle<T>, RegistryError>
    where
        F: FnOnce(RunContext<T>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, Failure>> + Send + 'static,
    {
        let key = key.into();
        if let OperationState::Failed(failure) = self.snapshot(&key) {
            info!(key = %key, previous = %failure, "retrying operation");
        }
        self.start(key, work)
    }

    /// Cancels the run in flight for `key` and resets it to `Idle`
    ///
    /// Returns false without touching anything if nothing was running.
    pub fn cancel(&self, key: &str) -> bool {
        let mut table = self.inner.lock();
        let Some(op) = table.ops.get_mut(key) else {
            return false;
        };
        let Some(run) = op.run.take() else {
            return false;
        };
        run.token.cancel();
        op.state = OperationState::Idle;
        self.inner.publish(&table, key);
        info!(key, run_id = run.id, "operation cancelled");
        true
    }

    /// Resets a finished key back to `Idle`; running keys are left alone
    pub fn clear(&self, key: &str) -> bool {
        let mut table = self.inner.lock();
        let Some(op) = table.ops.get_mut(key) else {
            return false;
        };
        if !op.state.is_terminal() {
            return false;
        }
        op.state = OperationState::Idle;
        self.inner.publish(&table, key);
        debug!(key, "operation cleared");
        true
    }

    /// Current state of `key`; unknown keys are `Idle`
    #[must_use]
    pub fn snapshot(&self, key: &str) -> OperationState<T> {
        self.inner.lock().state(key)
    }

    /// Current state of every key the registry has seen
    #[must_use]
    pub fn snapshot_all(&self) -> Snapshot<T> {
        self.inner.lock().snapshot()
    }

    /// How long the run in flight for `key` has been running
    #[must_use]
    pub fn running_for(&self, key: &str) -> Option<Duration> {
        self.inner
            .lock()
            .ops
            .get(key)
            .and_then(|op| op.run.as_ref())
            .map(|run| run.started_at.elapsed())
    }

    /// Subscribes to committed transitions
    #[must_use]
    pub fn subscribe(&self) -> Subscription<T> {
        Subscription::new(self.inner.events.subscribe(), self.inner.snapshots.subscribe())
    }

    /// Receiver that always holds the latest [`Registry::snapshot_all`]
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Snapshot<T>> {
        self.inner.snapshots.subscribe()
    }

    /// Cancels every run in flight and refuses new ones
    ///
    /// Cancelled keys become `Idle`; finished keys keep their state.
    pub fn shutdown(&self) {
        let mut table = self.inner.lock();
        if table.closed {
            return;
        }
        table.closed = true;
        self.inner.root.cancel();

        let mut cancelled = Vec::new();
        for (key, op) in &mut table.ops {
            if op.run.take().is_some() {
                op.state = OperationState::Idle;
                cancelled.push(key.clone());
            }
        }
        for key in &cancelled {
            self.inner.publish(&table, key);
        }
        info!(cancelled = cancelled.len(), "operation registry shut down");
    }

    /// Whether [`Registry::shutdown`] has been called
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().closed
    }
}
