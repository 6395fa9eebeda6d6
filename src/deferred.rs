//! Typed promise for a spawned task's result.

use std::any::Any;
use std::marker::PhantomData;

use crate::continuation::WaitTarget;
use crate::error::{Failure, TaskError};
use crate::job::{JobHandle, JobId, JobState};

/// Typed handle to a value-producing task started with `spawn`.
///
/// The success value is read-once: the first `get`/`await` moves it out and
/// later attempts see [`TaskError::ResultConsumed`]. Failures and
/// cancellations re-raise identically on every attempt, so awaiting a
/// failed deferred twice is safe and deterministic.
///
/// An unawaited deferred swallows its failure; nothing propagates to the
/// scope.
pub struct Deferred<T> {
    handle: JobHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Deferred<T> {
    pub(crate) fn new(handle: JobHandle) -> Self {
        Self {
            handle,
            _marker: PhantomData,
        }
    }

    /// The backing job's ID.
    #[inline]
    pub fn job_id(&self) -> JobId {
        self.handle.id()
    }

    /// Untyped handle to the backing job.
    #[inline]
    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    /// Current lifecycle state of the backing job.
    #[inline]
    pub fn state(&self) -> JobState {
        self.handle.state()
    }

    /// Suspension target for awaiting this deferred inside a task. Resumes
    /// with the typed value or the re-raised outcome.
    pub fn await_target(&self) -> WaitTarget {
        WaitTarget::Await(self.handle.clone())
    }
}

impl<T: 'static> Deferred<T> {
    /// Take the result without blocking. `None` while the job is still
    /// running.
    pub fn try_get(&self) -> Option<Result<T, TaskError>> {
        if !self.handle.state().is_terminal() {
            return None;
        }
        Some(Self::downcast(self.handle.shared().take_result()))
    }

    /// Block until terminal and take the result. External bridge for the
    /// owning application layer; inside a task, suspend on
    /// [`await_target`](Deferred::await_target) instead.
    pub fn get(&self) -> Result<T, TaskError> {
        self.handle.shared().wait_terminal();
        Self::downcast(self.handle.shared().take_result())
    }

    fn downcast(taken: Result<Box<dyn Any + Send>, TaskError>) -> Result<T, TaskError> {
        match taken {
            Ok(boxed) => boxed.downcast::<T>().map(|b| *b).map_err(|_| {
                TaskError::Failed(Failure::msg("deferred value has unexpected type"))
            }),
            Err(e) => Err(e),
        }
    }
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("job", &self.handle.id())
            .field("state", &self.handle.state())
            .finish()
    }
}
