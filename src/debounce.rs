use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::operation::{
    Failure, OperationState, Registry, RegistryError, RunHandle, RunOutcome, Subscription,
};

/// Latest payload waiting for its quiet period to elapse
struct Pending<P> {
    seq: u64,
    payload: P,
}

/// Per-resource state; no lock here is shared with another resource
struct Slot<P> {
    pending: Mutex<Option<Pending<P>>>,
    /// Held for the whole commit so commits for one resource never overlap
    gate: AsyncMutex<()>,
}

impl<P> Slot<P> {
    fn pending(&self) -> MutexGuard<'_, Option<Pending<P>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Shared<P, C> {
    commit: C,
    next_seq: AtomicU64,
    slots: RwLock<HashMap<String, Arc<Slot<P>>>>,
}

impl<P, C, Fut> Shared<P, C>
where
    P: Send + 'static,
    C: Fn(String, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Failure>> + Send + 'static,
{
    fn existing(&self, resource: &str) -> Option<Arc<Slot<P>>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource)
            .cloned()
    }

    fn slot(&self, resource: &str) -> Arc<Slot<P>> {
        if let Some(slot) = self.existing(resource) {
            return slot;
        }
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(resource.to_owned()).or_insert_with(|| {
            Arc::new(Slot {
                pending: Mutex::new(None),
                gate: AsyncMutex::new(()),
            })
        }))
    }

    fn all_slots(&self) -> Vec<(String, Arc<Slot<P>>)> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(resource, slot)| (resource.clone(), Arc::clone(slot)))
            .collect()
    }

    /// Commits the payload queued as `seq`, unless a newer request replaced it
    async fn commit_if_current(&self, resource: String, seq: u64) -> Result<(), Failure> {
        let Some(slot) = self.existing(&resource) else {
            return Ok(());
        };
        let _guard = slot.gate.lock().await;

        let payload = {
            let mut pending = slot.pending();
            if pending.as_ref().is_some_and(|entry| entry.seq == seq) {
                pending.take().map(|entry| entry.payload)
            } else {
                None
            }
        };
        let Some(payload) = payload else {
            debug!(resource = %resource, seq, "payload superseded before commit");
            return Ok(());
        };

        debug!(resource = %resource, seq, "committing payload");
        (self.commit)(resource, payload).await
    }
}

/// Coalesces rapid writes to a resource into one commit after a quiet period
///
/// Each [`Debouncer::request`] replaces the resource's pending payload and
/// restarts its timer. Only the latest payload is committed; earlier ones are
/// dropped. Resources are independent of each other.
///
/// On [`Debouncer::shutdown`] every pending payload is committed immediately
/// rather than dropped.
pub struct Debouncer<P, C> {
    registry: Registry<()>,
    quiet: Duration,
    shared: Arc<Shared<P, C>>,
}

impl<P, C> Clone for Debouncer<P, C> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            quiet: self.quiet,
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P, C, Fut> Debouncer<P, C>
where
    P: Send + 'static,
    C: Fn(String, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Failure>> + Send + 'static,
{
    /// Creates a debouncer that calls `commit(resource, payload)` after `quiet`
    ///
    /// # Errors
    /// Returns error when called outside a Tokio runtime
    pub fn new(quiet: Duration, commit: C) -> Result<Self, RegistryError> {
        Ok(Self::with_registry(Registry::new()?, quiet, commit))
    }

    /// Creates a debouncer whose timers run as operations in `registry`
    pub fn with_registry(registry: Registry<()>, quiet: Duration, commit: C) -> Self {
        Self {
            registry,
            quiet,
            shared: Arc::new(Shared {
                commit,
                next_seq: AtomicU64::new(1),
                slots: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Quiet period before a pending payload is committed
    #[must_use]
    pub const fn quiet_period(&self) -> Duration {
        self.quiet
    }

    /// Replaces the pending payload for `resource` and restarts its timer
    ///
    /// # Errors
    /// Returns error if `resource` is empty or the debouncer was shut down
    pub fn request(&self, resource: impl Into<String>, payload: P) -> Result<(), RegistryError> {
        let resource = resource.into();
        if resource.is_empty() {
            return Err(RegistryError::EmptyKey);
        }
        let slot = self.shared.slot(&resource);
        let mut pending = slot.pending();
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);

        // Timer and payload change together under the slot lock, so the
        // running timer always belongs to the payload that is pending.
        self.schedule(&resource, seq, self.quiet)?;
        *pending = Some(Pending { seq, payload });
        debug!(resource = %resource, seq, "payload pending");
        Ok(())
    }

    /// Commits the pending payload for `resource` now instead of after the
    /// quiet period. Returns `None` if nothing was pending.
    ///
    /// # Errors
    /// Returns error if the debouncer was shut down
    pub async fn flush(&self, resource: &str) -> Result<Option<RunOutcome<()>>, RegistryError> {
        let Some(slot) = self.shared.existing(resource) else {
            return Ok(None);
        };
        let handle = {
            let pending = slot.pending();
            let Some(entry) = pending.as_ref() else {
                return Ok(None);
            };
            self.schedule(resource, entry.seq, Duration::ZERO)?
        };
        Ok(Some(handle.outcome().await))
    }

    /// Drops the pending payload for `resource` without committing it
    ///
    /// Returns true if a payload was pending.
    pub fn discard(&self, resource: &str) -> bool {
        let Some(slot) = self.shared.existing(resource) else {
            return false;
        };
        let mut pending = slot.pending();
        if pending.take().is_none() {
            return false;
        }
        // Still under the slot lock: a concurrent request cannot slip a new
        // timer in between and have it cancelled here.
        self.registry.cancel(resource);
        debug!(resource, "pending payload discarded");
        true
    }

    /// Whether `resource` has a payload waiting to be committed
    #[must_use]
    pub fn is_pending(&self, resource: &str) -> bool {
        self.shared
            .existing(resource)
            .is_some_and(|slot| slot.pending().is_some())
    }

    /// State of the last commit (or running timer) for `resource`
    #[must_use]
    pub fn state(&self, resource: &str) -> OperationState<()> {
        self.registry.snapshot(resource)
    }

    /// Observes timer and commit transitions for every resource
    #[must_use]
    pub fn subscribe(&self) -> Subscription<()> {
        self.registry.subscribe()
    }

    /// Stops all timers and commits every pending payload immediately
    ///
    /// Waits for commits already in flight before returning. Returns the
    /// number of pending payloads committed successfully; failures are
    /// logged. Later requests are rejected with [`RegistryError::ShutDown`].
    pub async fn shutdown(&self) -> usize {
        self.registry.shutdown();

        let mut committed = 0;
        for (resource, slot) in self.shared.all_slots() {
            // Waits out any commit that already took its payload
            let _guard = slot.gate.lock().await;
            let Some(entry) = slot.pending().take() else {
                continue;
            };
            match (self.shared.commit)(resource.clone(), entry.payload).await {
                Ok(()) => {
                    committed += 1;
                    info!(resource = %resource, "flushed pending payload on shutdown");
                }
                Err(failure) => {
                    warn!(resource = %resource, reason = %failure, "failed to flush payload on shutdown");
                }
            }
        }
        committed
    }

    fn schedule(&self, resource: &str, seq: u64, delay: Duration) -> Result<RunHandle<()>, RegistryError> {
        let shared = Arc::clone(&self.shared);
        self.registry.start(resource, move |ctx| async move {
            if !delay.is_zero() {
                tokio::select! {
                    () = ctx.cancelled() => return Err(Failure::cancelled()),
                    () = sleep(delay) => {}
                }
            }
            shared.commit_if_current(ctx.key().to_owned(), seq).await
        })
    }
}
