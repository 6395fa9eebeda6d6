//! Scopes: the only way to start tasks.
//!
//! A scope wraps a root job that owns every task launched inside it, so
//! nothing outlives it silently. Closing a scope cancels the whole tree and
//! hands back a wait handle that settles only after every descendant has
//! reached a terminal state and run its cleanup.

use std::sync::Arc;

use tracing::debug;

use crate::context::TaskContext;
use crate::continuation::Continuation;
use crate::deferred::Deferred;
use crate::error::{CancelCause, DispatchError};
use crate::job::{JobHandle, JobKind, JobState};
use crate::scheduler::Runtime;

/// How a scope reacts to an unhandled launch failure among its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// One child's unhandled failure cancels every other task in the scope.
    #[default]
    FailFast,
    /// Children fail independently; the scope keeps running.
    Isolate,
}

/// A lifecycle-bound task container.
///
/// Dropping a `Scope` does not cancel it; call [`close`](Scope::close) (or
/// cancel the root) to tear the tree down. Handles stay valid after close.
pub struct Scope {
    runtime: Arc<Runtime>,
    root: JobHandle,
}

impl Scope {
    pub(crate) fn new(runtime: Arc<Runtime>, root: JobHandle) -> Self {
        Self { runtime, root }
    }

    /// The scope's root job handle.
    #[inline]
    pub fn root(&self) -> &JobHandle {
        &self.root
    }

    /// Whether the scope still accepts launches.
    #[inline]
    pub fn is_active(&self) -> bool {
        let state = self.root.state();
        !state.is_terminal() && state != JobState::Cancelling
    }

    /// Launch a fire-and-forget task in this scope. An unhandled failure
    /// surfaces to the scope per its [`FailurePolicy`].
    ///
    /// Launching on a closed or cancelling scope yields a handle that is
    /// already `Cancelled`; no work runs.
    pub fn launch(
        &self,
        ctx: TaskContext,
        body: impl Continuation + 'static,
    ) -> Result<JobHandle, DispatchError> {
        self.runtime
            .launch_job(self.root.id(), ctx, Box::new(body), JobKind::Launch)
    }

    /// Start a value-producing task in this scope and get a [`Deferred`]
    /// for its result. Failures are held in the deferred until awaited.
    pub fn spawn<T>(
        &self,
        ctx: TaskContext,
        body: impl Continuation + 'static,
    ) -> Result<Deferred<T>, DispatchError> {
        let handle = self
            .runtime
            .launch_job(self.root.id(), ctx, Box::new(body), JobKind::Async)?;
        Ok(Deferred::new(handle))
    }

    /// Cancel every task in the scope with an explicit cause. The scope
    /// stops accepting launches immediately; running tasks see the signal
    /// at their next suspension checkpoint.
    pub fn cancel(&self, cause: CancelCause) {
        self.runtime.cancel_job(self.root.id(), cause);
    }

    /// Close the scope: cancel the whole tree and return a handle that
    /// settles once every descendant is terminal and cleaned up.
    /// Idempotent; a second close returns an equivalent handle.
    pub fn close(&self) -> CloseHandle {
        debug!(scope = %self.root.id(), name = %self.root.name(), "closing scope");
        self.runtime
            .cancel_job(self.root.id(), CancelCause::scope_closed());
        CloseHandle {
            root: self.root.clone(),
        }
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("root", &self.root)
            .finish()
    }
}

/// Wait handle returned by [`Scope::close`]. Settles only after the entire
/// tree under the scope has reached terminal states.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    root: JobHandle,
}

impl CloseHandle {
    /// Block until the scope's tree is fully terminal.
    pub fn wait(&self) -> JobState {
        self.root.shared().wait_terminal()
    }

    /// The scope's root handle.
    #[inline]
    pub fn root(&self) -> &JobHandle {
        &self.root
    }
}

impl Runtime {
    /// Open a scope whose children default to `dispatcher` and `policy`.
    /// The context may carry a name and a scope-level failure handler.
    pub fn open_scope(
        self: &Arc<Self>,
        dispatcher: crate::dispatch::DispatcherHandle,
        policy: FailurePolicy,
        ctx: TaskContext,
    ) -> Scope {
        let root = self.create_root(dispatcher, policy, ctx);
        Scope::new(self.clone(), root)
    }
}
