//! Execution substrate: dispatchers accept runnable work and nothing else.
//!
//! A dispatcher has no knowledge of job state. The scheduler submits opaque
//! closures; ordering is FIFO-per-worker best effort only, with no guarantee
//! across submissions. Thread provisioning (pool sizing, keep-alive) is
//! plain configuration, not part of the scheduling contract.

pub mod elastic;
pub mod pool;

pub use elastic::ElasticDispatcher;
pub use pool::{PoolDispatcher, SerialDispatcher};

use std::sync::Arc;

use crate::error::DispatchError;

/// Unit of work accepted by a dispatcher.
pub type Runnable = Box<dyn FnOnce() + Send>;

/// An execution substrate onto which runnable continuations are submitted.
pub trait Dispatch: Send + Sync {
    /// Schedule `work` without blocking the caller. Rejection (shutdown,
    /// saturated queue) is reported synchronously, never queued.
    fn submit(&self, work: Runnable) -> Result<(), DispatchError>;

    /// Dispatcher name, for diagnostics.
    fn name(&self) -> &str;
}

/// Shared handle to a dispatcher.
pub type DispatcherHandle = Arc<dyn Dispatch>;
