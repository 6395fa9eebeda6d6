//! Job identity, lifecycle states and the write-once result slot.
//!
//! A [`JobHandle`] is the external face of one scheduled unit of work. The
//! coordination state (frames, waiters, children) lives in the scheduler's
//! arena and is reclaimed at finalization; the [`JobShared`] block outlives
//! the arena record so handles never dangle and blocking callers always have
//! something to wait on.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use crate::error::{CancelCause, DispatchError, Failure, TaskError};
use crate::scheduler::Runtime;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl JobId {
    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Job({})", self.0)
    }
}

/// Monotonic job ID generator.
#[derive(Debug, Default)]
pub struct JobIdGen {
    next: AtomicU64,
}

impl JobIdGen {
    /// Create a new generator starting at zero.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate the next ID.
    #[inline]
    pub fn next_id(&self) -> JobId {
        JobId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Job lifecycle state.
///
/// Legal advances only:
/// `Active -> {Completing | Cancelling | Completed | Failed}`,
/// `Completing -> {Cancelling | Completed | Failed}`,
/// `Cancelling -> Cancelled`. Terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Body running or suspended; children may exist.
    Active,
    /// Body finished, waiting for children to reach a terminal state.
    Completing,
    /// Cancellation requested; signal delivery / unwinding in progress.
    Cancelling,
    /// Terminal: cancelled, with a cause.
    Cancelled,
    /// Terminal: completed with a result.
    Completed,
    /// Terminal: the body failed. Never conflated with `Cancelled`.
    Failed,
}

impl JobState {
    /// Convert from u8 (for compact storage).
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => JobState::Active,
            1 => JobState::Completing,
            2 => JobState::Cancelling,
            3 => JobState::Cancelled,
            4 => JobState::Completed,
            _ => JobState::Failed,
        }
    }

    /// Convert to u8 (for compact storage).
    #[inline]
    pub fn as_u8(&self) -> u8 {
        match self {
            JobState::Active => 0,
            JobState::Completing => 1,
            JobState::Cancelling => 2,
            JobState::Cancelled => 3,
            JobState::Completed => 4,
            JobState::Failed => 5,
        }
    }

    /// Whether this state is terminal.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Cancelled | JobState::Completed | JobState::Failed
        )
    }

    /// Whether a transition from `self` to `next` is legal.
    pub fn can_advance_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Active, Completing | Cancelling | Completed | Failed) => true,
            (Completing, Cancelling | Completed | Failed) => true,
            (Cancelling, Cancelled) => true,
            _ => false,
        }
    }
}

/// What kind of builder created a job. Drives failure propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Fire-and-forget; unhandled failures surface to the scope.
    Launch,
    /// Deferred-producing; failures are held until awaited.
    Async,
    /// A scope's root job; no body, exists to own children.
    ScopeRoot,
}

/// Write-once terminal outcome of a job.
#[derive(Debug)]
pub enum Outcome {
    /// Success value; moved out by the first await.
    Success(Box<dyn std::any::Any + Send>),
    /// Success value already taken.
    Consumed,
    /// Body failure; cloned on every read.
    Failed(Failure),
    /// Cancelled with a cause; cloned on every read.
    Cancelled(CancelCause),
    /// The job's continuation could not be resubmitted to its dispatcher.
    Rejected(DispatchError),
}

struct SharedState {
    state: JobState,
    outcome: Option<Outcome>,
}

/// State shared between the arena record and all handles to one job.
pub struct JobShared {
    name: Arc<str>,
    inner: Mutex<SharedState>,
    terminal: Condvar,
}

impl JobShared {
    pub(crate) fn new(name: Arc<str>) -> Self {
        Self {
            name,
            inner: Mutex::new(SharedState {
                state: JobState::Active,
                outcome: None,
            }),
            terminal: Condvar::new(),
        }
    }

    pub(crate) fn new_terminal(name: Arc<str>, state: JobState, outcome: Outcome) -> Self {
        Self {
            name,
            inner: Mutex::new(SharedState {
                state,
                outcome: Some(outcome),
            }),
            terminal: Condvar::new(),
        }
    }

    /// Job name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> JobState {
        self.inner.lock().state
    }

    /// Advance the state. Illegal advances are ignored; terminal states
    /// are immutable.
    pub(crate) fn advance(&self, next: JobState) -> bool {
        let mut inner = self.inner.lock();
        if !inner.state.can_advance_to(next) {
            return false;
        }
        inner.state = next;
        true
    }

    /// Write the terminal outcome and wake blocking waiters. The slot is
    /// write-once: a second call is ignored.
    pub(crate) fn finalize(&self, state: JobState, outcome: Outcome) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = state;
        inner.outcome = Some(outcome);
        self.terminal.notify_all();
        true
    }

    /// Block until the job is terminal. External bridge only; never called
    /// from a dispatcher worker.
    pub(crate) fn wait_terminal(&self) -> JobState {
        let mut inner = self.inner.lock();
        while !inner.state.is_terminal() {
            self.terminal.wait(&mut inner);
        }
        inner.state
    }

    /// Join result: `Ok(())` on completion, the distinct cancellation or
    /// failure outcome otherwise. Does not consume the success value.
    pub(crate) fn join_result(&self) -> Result<(), TaskError> {
        let inner = self.inner.lock();
        match inner.outcome.as_ref() {
            Some(Outcome::Success(_)) | Some(Outcome::Consumed) => Ok(()),
            Some(Outcome::Failed(f)) => Err(TaskError::Failed(f.clone())),
            Some(Outcome::Cancelled(c)) => Err(TaskError::Cancelled(c.clone())),
            Some(Outcome::Rejected(e)) => Err(TaskError::Rejected(e.clone())),
            None => Ok(()),
        }
    }

    /// Take the success value (read-once) or re-raise the stored
    /// failure/cancellation. Failures re-raise identically forever.
    pub(crate) fn take_result(&self) -> Result<Box<dyn std::any::Any + Send>, TaskError> {
        let mut inner = self.inner.lock();
        match inner.outcome.as_mut() {
            Some(slot @ Outcome::Success(_)) => {
                let taken = std::mem::replace(slot, Outcome::Consumed);
                match taken {
                    Outcome::Success(v) => Ok(v),
                    _ => unreachable!("slot was Success"),
                }
            }
            Some(Outcome::Consumed) => Err(TaskError::ResultConsumed),
            Some(Outcome::Failed(f)) => Err(TaskError::Failed(f.clone())),
            Some(Outcome::Cancelled(c)) => Err(TaskError::Cancelled(c.clone())),
            Some(Outcome::Rejected(e)) => Err(TaskError::Rejected(e.clone())),
            None => Err(TaskError::ResultConsumed),
        }
    }
}

impl fmt::Debug for JobShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobShared")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Public handle to a scheduled job.
#[derive(Clone)]
pub struct JobHandle {
    id: JobId,
    shared: Arc<JobShared>,
    runtime: Weak<Runtime>,
}

impl JobHandle {
    pub(crate) fn new(id: JobId, shared: Arc<JobShared>, runtime: Weak<Runtime>) -> Self {
        Self {
            id,
            shared,
            runtime,
        }
    }

    /// The job's ID.
    #[inline]
    pub fn id(&self) -> JobId {
        self.id
    }

    /// The job's name.
    #[inline]
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> JobState {
        self.shared.state()
    }

    /// Whether the job has not yet reached a terminal state.
    #[inline]
    pub fn is_active(&self) -> bool {
        !self.shared.state().is_terminal()
    }

    /// Request cancellation of this job and its whole subtree. Top-down,
    /// immediate; the signal is applied at each continuation's next
    /// suspension checkpoint.
    pub fn cancel(&self, cause: CancelCause) {
        if let Some(rt) = self.runtime.upgrade() {
            rt.cancel_job(self.id, cause);
        }
    }

    /// Block until the job is terminal; no value. External bridge for the
    /// owning application layer; inside a task, suspend on
    /// [`WaitTarget::Join`](crate::continuation::WaitTarget::Join) instead.
    pub fn join(&self) -> Result<(), TaskError> {
        self.shared.wait_terminal();
        self.shared.join_result()
    }

    pub(crate) fn shared(&self) -> &Arc<JobShared> {
        &self.shared
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}
