//! Resumable computations.
//!
//! A continuation is the explicit tagged-state representation of one logical
//! sequential computation: the scheduler's trampoline calls [`step`] with an
//! input (start, a resumed value, or a cancellation signal) and the
//! continuation either finishes, fails, or names the next thing it is
//! waiting on. Suspension releases the worker thread; nothing here blocks.
//!
//! [`step`]: Continuation::step

use std::any::Any;
use std::collections::VecDeque;
use std::time::Duration;

use crate::dispatch::DispatcherHandle;
use crate::error::{CancelCause, Failure, TaskError};
use crate::job::JobHandle;
use crate::scheduler::{SourceHandle, TaskCx};

/// Type-erased task value.
pub type BoxedAny = Box<dyn Any + Send>;

/// Value-or-outcome delivered to a resumed continuation.
pub type Resumed = Result<BoxedAny, TaskError>;

/// Registration hook for an external asynchronous source. Called once with
/// a single-shot [`SourceHandle`]; the source must complete it exactly once
/// (late or duplicate completions are ignored by the scheduler).
pub type Registration = Box<dyn FnOnce(SourceHandle) + Send>;

/// Input fed into one trampoline step.
pub enum StepInput {
    /// First step of a freshly launched job.
    Start,
    /// The awaited source finished; its value or terminal outcome.
    Resume(Resumed),
    /// Cooperative cancellation, delivered only at suspension checkpoints.
    /// After this input the job finalizes `Cancelled` regardless of the
    /// step's output; the step is the place to run scoped cleanup.
    Cancel(CancelCause),
}

/// What a trampoline step produced.
pub enum StepOutput {
    /// The body finished with a value.
    Complete(BoxedAny),
    /// The body failed.
    Fail(Failure),
    /// Suspend until the target is ready, releasing the worker thread.
    Suspend(WaitTarget),
}

/// What a suspended continuation is waiting on.
pub enum WaitTarget {
    /// Suspend until the job is terminal; resumes with `Ok(())` boxed or
    /// its distinct cancellation/failure outcome.
    Join(JobHandle),
    /// Suspend until the deferred's job is terminal; resumes with the
    /// taken value or re-raised outcome.
    Await(JobHandle),
    /// Suspend until every member is terminal. The first failure or
    /// cancellation among members resumes the awaiter immediately and the
    /// remaining members are cancelled (fail-fast). On success resumes
    /// with a boxed `Vec<BoxedAny>` in member order.
    AwaitAll(Vec<JobHandle>),
    /// Run `body` on `dispatcher` under the same job identity, then resume
    /// this continuation with the body's result. No new job is created, so
    /// enclosing cancellation still applies.
    Switch {
        dispatcher: DispatcherHandle,
        body: Box<dyn Continuation>,
    },
    /// Suspend on the runtime's timer.
    Sleep(Duration),
    /// Suspend on an external one-shot source (network/disk bridge).
    External(Registration),
}

/// Dispatcher switch: run `body` on `dispatcher` and resume the caller
/// with its result. The withContext operation.
pub fn with_context(dispatcher: DispatcherHandle, body: impl Continuation + 'static) -> WaitTarget {
    WaitTarget::Switch {
        dispatcher,
        body: Box::new(body),
    }
}

/// Suspend until all of `jobs` are terminal, fail-fast.
pub fn await_all<I>(jobs: I) -> WaitTarget
where
    I: IntoIterator<Item = JobHandle>,
{
    WaitTarget::AwaitAll(jobs.into_iter().collect())
}

/// Suspend on the runtime's timer.
#[inline]
pub fn sleep(duration: Duration) -> WaitTarget {
    WaitTarget::Sleep(duration)
}

/// A resumable unit of computation, stepped by the scheduler trampoline.
///
/// Owned exclusively by its job; `step` is never called concurrently for
/// the same continuation.
pub trait Continuation: Send {
    /// Advance the computation by one step.
    fn step(&mut self, cx: &TaskCx, input: StepInput) -> StepOutput;
}

/// Box a success value for [`StepOutput::Complete`] / [`StageOut::Complete`].
#[inline]
pub fn value<T: Send + 'static>(v: T) -> BoxedAny {
    Box::new(v)
}

/// Downcast a resumed value to its concrete type.
pub fn downcast_resumed<T: 'static>(resumed: Resumed) -> Result<T, TaskError> {
    match resumed {
        Ok(boxed) => boxed
            .downcast::<T>()
            .map(|b| *b)
            .map_err(|_| TaskError::Failed(Failure::msg("resumed value has unexpected type"))),
        Err(e) => Err(e),
    }
}

/// Downcast an awaitAll result to a vector of concrete values.
pub fn downcast_all<T: 'static>(resumed: Resumed) -> Result<Vec<T>, TaskError> {
    let values = downcast_resumed::<Vec<BoxedAny>>(resumed)?;
    values
        .into_iter()
        .map(|boxed| {
            boxed
                .downcast::<T>()
                .map(|b| *b)
                .map_err(|_| TaskError::Failed(Failure::msg("awaitAll member has unexpected type")))
        })
        .collect()
}

/// Single-step body built from a closure; runs once and completes. The
/// common shape for plain launches with no suspension points.
pub struct FnJob<F> {
    body: Option<F>,
}

impl<F> FnJob<F>
where
    F: FnOnce(&TaskCx) -> Result<BoxedAny, Failure> + Send,
{
    /// Wrap a closure as a one-shot continuation.
    pub fn new(body: F) -> Self {
        Self { body: Some(body) }
    }
}

impl<F> Continuation for FnJob<F>
where
    F: FnOnce(&TaskCx) -> Result<BoxedAny, Failure> + Send,
{
    fn step(&mut self, cx: &TaskCx, input: StepInput) -> StepOutput {
        match input {
            StepInput::Cancel(_) => {
                // Cancelled before the body ran; nothing to clean up.
                self.body = None;
                StepOutput::Complete(value(()))
            }
            _ => match self.body.take() {
                Some(body) => match body(cx) {
                    Ok(v) => StepOutput::Complete(v),
                    Err(e) => StepOutput::Fail(e),
                },
                None => StepOutput::Complete(value(())),
            },
        }
    }
}

/// Shorthand for [`FnJob::new`].
pub fn run_once<F>(body: F) -> FnJob<F>
where
    F: FnOnce(&TaskCx) -> Result<BoxedAny, Failure> + Send,
{
    FnJob::new(body)
}

/// Outcome of one stage of a [`Stages`] continuation.
pub enum StageOut {
    /// Suspend; the next stage receives the resumed input.
    Suspend(WaitTarget),
    /// Finish with a value; remaining stages are discarded.
    Complete(BoxedAny),
    /// Fail; remaining stages are discarded.
    Fail(Failure),
}

type StageFn = Box<dyn FnOnce(&TaskCx, StepInput) -> StageOut + Send>;
type CleanupFn = Box<dyn FnOnce(&TaskCx) + Send>;

/// Ordered multi-stage state machine: each stage runs between two
/// suspension points. Saves hand-rolling the [`Continuation`] trait for
/// sequential bodies with awaits in the middle.
#[derive(Default)]
pub struct Stages {
    stages: VecDeque<StageFn>,
    cleanup: Option<CleanupFn>,
}

impl Stages {
    /// Empty state machine; completes immediately with `()`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage.
    pub fn then<F>(mut self, stage: F) -> Self
    where
        F: FnOnce(&TaskCx, StepInput) -> StageOut + Send + 'static,
    {
        self.stages.push_back(Box::new(stage));
        self
    }

    /// Scoped cleanup, run if a cancellation signal arrives before the
    /// stages finish.
    pub fn on_cancel<F>(mut self, cleanup: F) -> Self
    where
        F: FnOnce(&TaskCx) + Send + 'static,
    {
        self.cleanup = Some(Box::new(cleanup));
        self
    }
}

impl Continuation for Stages {
    fn step(&mut self, cx: &TaskCx, input: StepInput) -> StepOutput {
        if let StepInput::Cancel(cause) = input {
            self.stages.clear();
            if let Some(cleanup) = self.cleanup.take() {
                cleanup(cx);
            }
            // Output is ignored after a cancellation delivery.
            return StepOutput::Fail(Failure::msg(format!("cancelled: {cause}")));
        }
        match self.stages.pop_front() {
            Some(stage) => match stage(cx, input) {
                StageOut::Suspend(target) => StepOutput::Suspend(target),
                StageOut::Complete(v) => {
                    self.stages.clear();
                    self.cleanup = None;
                    StepOutput::Complete(v)
                }
                StageOut::Fail(e) => {
                    self.stages.clear();
                    self.cleanup = None;
                    StepOutput::Fail(e)
                }
            },
            None => StepOutput::Complete(value(())),
        }
    }
}

impl std::fmt::Debug for Stages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stages")
            .field("remaining", &self.stages.len())
            .field("has_cleanup", &self.cleanup.is_some())
            .finish()
    }
}
