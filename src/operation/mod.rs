/// Cooperative cancellation
pub mod cancel;
/// Transition events and snapshots for observers
pub mod observer;
/// Keyed operation registry
pub mod registry;
/// Operation states and failures
pub mod state;

pub use cancel::CancelToken;
pub use observer::{Snapshot, Subscription, Transition};
pub use registry::{Registry, RegistryError, RunContext, RunHandle};
pub use state::{Failure, FailureKind, OperationState, RunOutcome};
