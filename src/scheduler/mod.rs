//! Scheduler core: couples job state transitions to dispatcher execution.
//!
//! The [`Runtime`] owns a job arena keyed by id (parent owns children by id,
//! children hold a non-owning id back-reference, so the naturally cyclic
//! parent/child shape never forms a true reference cycle). A trampoline
//! steps each job's continuation on its resolved dispatcher; on suspension
//! the worker thread is released and a one-shot resumption is registered on
//! the awaited source. No user code ever runs under the arena lock.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tracing::{debug, error, trace, warn};

use crate::context::{FailureHandler, TaskContext};
use crate::continuation::{
    value, BoxedAny, Continuation, Registration, StepInput, StepOutput, WaitTarget,
};
use crate::deferred::Deferred;
use crate::dispatch::DispatcherHandle;
use crate::error::{CancelCause, DispatchError, Failure, TaskError};
use crate::job::{JobHandle, JobId, JobIdGen, JobKind, JobShared, JobState, Outcome};
use crate::scope::FailurePolicy;
use crate::time::Timer;

/// Process-wide fallback for unhandled launch failures.
static DEFAULT_FAILURE_HANDLER: Lazy<RwLock<Option<FailureHandler>>> =
    Lazy::new(|| RwLock::new(None));

/// Install the process-wide failure handler. Replaces any previous one.
pub fn set_default_failure_handler(handler: FailureHandler) {
    *DEFAULT_FAILURE_HANDLER.write() = Some(handler);
}

/// Remove the process-wide failure handler.
pub fn clear_default_failure_handler() {
    *DEFAULT_FAILURE_HANDLER.write() = None;
}

fn default_failure_handler() -> Option<FailureHandler> {
    DEFAULT_FAILURE_HANDLER.read().clone()
}

/// Runtime counters.
#[derive(Debug, Default)]
pub struct RuntimeStats {
    /// Jobs created via launch/spawn.
    pub jobs_launched: AtomicUsize,
    /// Jobs that completed with a value.
    pub jobs_completed: AtomicUsize,
    /// Jobs that ended failed.
    pub jobs_failed: AtomicUsize,
    /// Jobs that ended cancelled.
    pub jobs_cancelled: AtomicUsize,
}

impl RuntimeStats {
    #[inline]
    fn record_launched(&self) {
        self.jobs_launched.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_terminal(&self, state: JobState) {
        match state {
            JobState::Completed => self.jobs_completed.fetch_add(1, Ordering::Relaxed),
            JobState::Failed => self.jobs_failed.fetch_add(1, Ordering::Relaxed),
            _ => self.jobs_cancelled.fetch_add(1, Ordering::Relaxed),
        };
    }
}

/// What a suspended job is waiting on.
enum WaitState {
    /// Not suspended: stepping, queued, or body-finished.
    None,
    /// One-shot external source or timer; guarded by the wait epoch.
    External,
    /// Joining or awaiting a single job.
    On { kind: AwaitKind },
    /// awaitAll over several members.
    All {
        members: Vec<JobHandle>,
        remaining: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AwaitKind {
    Join,
    Await,
    AllMember,
}

/// Entry on a target job's waiter list.
struct Waiter {
    job: JobId,
    epoch: u64,
    kind: AwaitKind,
}

/// One level of a job's continuation stack. `withContext` pushes a frame
/// carrying the switched dispatcher; the job identity stays the same.
struct Frame {
    cont: Option<Box<dyn Continuation>>,
    dispatcher: DispatcherHandle,
}

struct JobRecord {
    parent: Option<JobId>,
    children: SmallVec<[JobId; 4]>,
    shared: Arc<JobShared>,
    kind: JobKind,
    dispatcher: DispatcherHandle,
    on_failure: Option<FailureHandler>,
    policy: FailurePolicy,
    frames: Vec<Frame>,
    wait: WaitState,
    epoch: u64,
    waiters: SmallVec<[Waiter; 2]>,
    pending_cancel: Option<CancelCause>,
    cancel_cause: Option<CancelCause>,
    body_result: Option<Result<BoxedAny, Failure>>,
    scope_failure: Option<Failure>,
    stepping: bool,
    unwinding: bool,
}

struct Arena {
    jobs: HashMap<JobId, JobRecord>,
}

/// Terminal outcome being applied to a job.
enum Terminal {
    Completed(BoxedAny),
    Failed(Failure),
    Cancelled(CancelCause),
    Rejected(DispatchError),
}

/// Deferred side effects collected under the arena lock and executed after
/// it is released; user code (handlers, registrations, cleanup) never runs
/// while the lock is held.
enum AfterOp {
    Handler(FailureHandler, Arc<str>, Failure),
    Register(Registration, SourceHandle),
    Sleep(std::time::Duration, SourceHandle),
    Unwind {
        job: JobId,
        frames: Vec<Frame>,
        cause: CancelCause,
        cx: TaskCx,
    },
}

/// The scheduler core. Owns the job arena and the timer; execution itself
/// happens on caller-provided dispatchers.
pub struct Runtime {
    arena: Mutex<Arena>,
    ids: JobIdGen,
    timer: Timer,
    stats: RuntimeStats,
}

impl Runtime {
    /// Create a runtime. Dispatchers are provisioned by the caller and
    /// passed per scope or per context.
    pub fn new() -> Arc<Runtime> {
        Arc::new(Runtime {
            arena: Mutex::new(Arena {
                jobs: HashMap::new(),
            }),
            ids: JobIdGen::new(),
            timer: Timer::new(),
            stats: RuntimeStats::default(),
        })
    }

    /// Runtime counters.
    #[inline]
    pub fn stats(&self) -> &RuntimeStats {
        &self.stats
    }

    /// Number of live (non-finalized) jobs, roots included.
    pub fn live_jobs(&self) -> usize {
        self.arena.lock().jobs.len()
    }

    // ------------------------------------------------------------------
    // Job creation
    // ------------------------------------------------------------------

    pub(crate) fn create_root(
        self: &Arc<Self>,
        dispatcher: DispatcherHandle,
        policy: FailurePolicy,
        ctx: TaskContext,
    ) -> JobHandle {
        let id = self.ids.next_id();
        let name: Arc<str> = ctx
            .name()
            .cloned()
            .unwrap_or_else(|| format!("scope-{}", id.inner()).into());
        let shared = Arc::new(JobShared::new(name));
        let record = JobRecord {
            parent: None,
            children: SmallVec::new(),
            shared: shared.clone(),
            kind: JobKind::ScopeRoot,
            dispatcher,
            on_failure: ctx.failure_handler().cloned(),
            policy,
            frames: Vec::new(),
            wait: WaitState::None,
            epoch: 0,
            waiters: SmallVec::new(),
            pending_cancel: None,
            cancel_cause: None,
            body_result: None,
            scope_failure: None,
            stepping: false,
            unwinding: false,
        };
        self.arena.lock().jobs.insert(id, record);
        debug!(job = %id, name = %shared.name(), "scope opened");
        JobHandle::new(id, shared, Arc::downgrade(self))
    }

    /// Allocate a job under `parent`, attach it, and submit its initial
    /// continuation to the resolved dispatcher.
    pub(crate) fn launch_job(
        self: &Arc<Self>,
        parent: JobId,
        ctx: TaskContext,
        body: Box<dyn Continuation>,
        kind: JobKind,
    ) -> Result<JobHandle, DispatchError> {
        let id = self.ids.next_id();
        let name: Arc<str> = ctx
            .name()
            .cloned()
            .unwrap_or_else(|| format!("job-{}", id.inner()).into());

        let mut arena = self.arena.lock();
        let Some(prec) = arena.jobs.get_mut(&parent) else {
            // Parent already finalized: the job is born cancelled.
            return Ok(self.stillborn(id, name));
        };
        let pstate = prec.shared.state();
        if pstate.is_terminal() || pstate == JobState::Cancelling {
            return Ok(self.stillborn(id, name));
        }

        let dispatcher = ctx
            .dispatcher()
            .cloned()
            .unwrap_or_else(|| prec.dispatcher.clone());
        let policy = prec.policy;
        prec.children.push(id);

        let shared = Arc::new(JobShared::new(name));
        let record = JobRecord {
            parent: Some(parent),
            children: SmallVec::new(),
            shared: shared.clone(),
            kind,
            dispatcher: dispatcher.clone(),
            on_failure: ctx.failure_handler().cloned(),
            policy,
            frames: vec![Frame {
                cont: Some(body),
                dispatcher: dispatcher.clone(),
            }],
            wait: WaitState::None,
            epoch: 0,
            waiters: SmallVec::new(),
            pending_cancel: None,
            cancel_cause: None,
            body_result: None,
            scope_failure: None,
            stepping: false,
            unwinding: false,
        };
        arena.jobs.insert(id, record);

        let rt = self.clone();
        if let Err(err) = dispatcher.submit(Box::new(move || rt.step_job(id, StepInput::Start))) {
            // Rejection is fatal to the submission attempt and surfaced
            // synchronously; the job never ran.
            arena.jobs.remove(&id);
            if let Some(prec) = arena.jobs.get_mut(&parent) {
                prec.children.retain(|c| *c != id);
            }
            warn!(job = %id, %err, "initial dispatch rejected");
            return Err(err);
        }

        self.stats.record_launched();
        trace!(job = %id, name = %shared.name(), kind = ?kind, dispatcher = dispatcher.name(), "job launched");
        Ok(JobHandle::new(id, shared, Arc::downgrade(self)))
    }

    fn stillborn(self: &Arc<Self>, id: JobId, name: Arc<str>) -> JobHandle {
        let cause = CancelCause::scope_closed();
        let shared = Arc::new(JobShared::new_terminal(
            name,
            JobState::Cancelled,
            Outcome::Cancelled(cause),
        ));
        trace!(job = %id, "launch on cancelled parent: job born cancelled");
        JobHandle::new(id, shared, Arc::downgrade(self))
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    /// Cancel a job and its whole subtree, top-down, in one pass.
    pub fn cancel_job(self: &Arc<Self>, id: JobId, cause: CancelCause) {
        let mut after = Vec::new();
        {
            let mut arena = self.arena.lock();
            self.cancel_tree_locked(&mut arena, id, cause, &mut after);
        }
        self.run_after(after);
    }

    fn cancel_tree_locked(
        self: &Arc<Self>,
        arena: &mut Arena,
        root: JobId,
        cause: CancelCause,
        after: &mut Vec<AfterOp>,
    ) {
        let mut stack = vec![(root, cause)];
        while let Some((id, cause)) = stack.pop() {
            let Some(rec) = arena.jobs.get_mut(&id) else {
                continue;
            };
            let state = rec.shared.state();
            if state.is_terminal() || state == JobState::Cancelling {
                continue;
            }
            rec.shared.advance(JobState::Cancelling);
            rec.cancel_cause = Some(cause.clone());
            trace!(job = %id, %cause, "cancelling");
            for child in rec.children.iter() {
                stack.push((*child, CancelCause::parent(&cause)));
            }

            let wait = std::mem::replace(&mut rec.wait, WaitState::None);
            let frames_empty = rec.frames.is_empty();
            let children_empty = rec.children.is_empty();
            match wait {
                WaitState::External => {
                    // Invalidate the outstanding one-shot handle and resume
                    // with the cancellation signal instead.
                    rec.epoch += 1;
                    self.submit_input_locked(arena, id, StepInput::Cancel(cause), after);
                }
                WaitState::On { .. } => {
                    self.clear_waiter_entries(arena, id);
                    self.submit_input_locked(arena, id, StepInput::Cancel(cause), after);
                }
                WaitState::All { members, .. } => {
                    for member in &members {
                        if let Some(mrec) = arena.jobs.get_mut(&member.id()) {
                            mrec.waiters.retain(|w| w.job != id);
                        }
                    }
                    self.submit_input_locked(arena, id, StepInput::Cancel(cause), after);
                }
                WaitState::None if frames_empty => {
                    // Scope root or body-finished job: no continuation left
                    // to signal. Finalize now if no children remain.
                    if children_empty {
                        self.finalize_locked(arena, id, Terminal::Cancelled(cause), after);
                    }
                }
                WaitState::None => {
                    // Stepping right now, or an input is queued on the
                    // dispatcher: apply at the next checkpoint.
                    if let Some(rec) = arena.jobs.get_mut(&id) {
                        rec.pending_cancel = Some(cause);
                    }
                }
            }
        }
    }

    /// Drop this job's waiter entries from whatever single target it was
    /// registered on.
    fn clear_waiter_entries(&self, arena: &mut Arena, waiter: JobId) {
        for rec in arena.jobs.values_mut() {
            rec.waiters.retain(|w| w.job != waiter);
        }
    }

    // ------------------------------------------------------------------
    // Trampoline
    // ------------------------------------------------------------------

    /// Run one step of a job's topmost continuation frame. Entered only
    /// from dispatcher workers.
    pub(crate) fn step_job(self: &Arc<Self>, id: JobId, mut input: StepInput) {
        let (cont, cx, cancel) = {
            let mut arena = self.arena.lock();
            let Some(rec) = arena.jobs.get_mut(&id) else {
                return; // finalized while queued
            };
            // Suspension checkpoint: a pending cancellation outranks the
            // queued input.
            if !matches!(input, StepInput::Cancel(_)) {
                if let Some(cause) = rec.pending_cancel.take() {
                    input = StepInput::Cancel(cause);
                }
            }
            let cancel = match &input {
                StepInput::Cancel(cause) => {
                    rec.shared.advance(JobState::Cancelling);
                    rec.cancel_cause.get_or_insert_with(|| cause.clone());
                    Some(cause.clone())
                }
                _ => None,
            };
            rec.wait = WaitState::None;
            let Some(cont) = rec.frames.last_mut().and_then(|f| f.cont.take()) else {
                return; // nothing to step (scope root)
            };
            rec.stepping = true;
            let cx = TaskCx {
                runtime: self.clone(),
                job: id,
                shared: rec.shared.clone(),
            };
            (cont, cx, cancel)
        };

        let cx2 = cx.clone();
        let stepped = catch_unwind(AssertUnwindSafe(move || {
            let mut cont = cont;
            let out = cont.step(&cx2, input);
            (cont, out)
        }));

        match stepped {
            Ok((cont, out)) => self.apply_step(id, Some(cont), out, cancel, cx),
            Err(payload) => self.apply_step(
                id,
                None,
                StepOutput::Fail(Failure::from_panic(payload)),
                cancel,
                cx,
            ),
        }
    }

    fn apply_step(
        self: &Arc<Self>,
        id: JobId,
        cont: Option<Box<dyn Continuation>>,
        out: StepOutput,
        cancel: Option<CancelCause>,
        cx: TaskCx,
    ) {
        let mut after = Vec::new();
        {
            let mut arena = self.arena.lock();
            let Some(rec) = arena.jobs.get_mut(&id) else {
                return;
            };
            rec.stepping = false;

            if let Some(cause) = cancel {
                // The signal was delivered; unwind remaining frames so
                // scoped cleanup runs, then finalize Cancelled. The step's
                // own output is ignored.
                rec.frames.pop();
                let frames = std::mem::take(&mut rec.frames);
                let children_empty = rec.children.is_empty();
                if !frames.is_empty() {
                    rec.unwinding = true;
                    after.push(AfterOp::Unwind {
                        job: id,
                        frames,
                        cause,
                        cx,
                    });
                } else if children_empty {
                    self.finalize_locked(&mut arena, id, Terminal::Cancelled(cause), &mut after);
                }
                // Children still live: the last one to detach finalizes
                // this job.
            } else {
                match out {
                    StepOutput::Suspend(target) => {
                        if let Some(frame) = rec.frames.last_mut() {
                            frame.cont = cont;
                        }
                        if let Some(cause) = rec.pending_cancel.take() {
                            // Checkpoint: cancellation wins over suspension.
                            self.submit_input_locked(
                                &mut arena,
                                id,
                                StepInput::Cancel(cause),
                                &mut after,
                            );
                        } else {
                            self.register_wait_locked(&mut arena, id, target, &mut after);
                        }
                    }
                    StepOutput::Complete(v) => {
                        rec.frames.pop();
                        let body_done = rec.frames.is_empty();
                        if body_done {
                            self.body_complete_locked(&mut arena, id, Ok(v), &mut after);
                        } else {
                            // Inner dispatcher-switch frame finished: resume
                            // the outer frame on its own dispatcher.
                            self.submit_input_locked(
                                &mut arena,
                                id,
                                StepInput::Resume(Ok(v)),
                                &mut after,
                            );
                        }
                    }
                    StepOutput::Fail(e) => {
                        rec.frames.pop();
                        let body_done = rec.frames.is_empty();
                        if body_done {
                            self.body_complete_locked(&mut arena, id, Err(e), &mut after);
                        } else {
                            // An inner frame's failure propagates to the
                            // calling frame as a resumed error.
                            self.submit_input_locked(
                                &mut arena,
                                id,
                                StepInput::Resume(Err(TaskError::Failed(e))),
                                &mut after,
                            );
                        }
                    }
                }
            }
        }
        self.run_after(after);
    }

    /// Body (outermost frame) finished: move to Completing if children are
    /// still pending, otherwise finalize. Cancellation outranks completion.
    fn body_complete_locked(
        self: &Arc<Self>,
        arena: &mut Arena,
        id: JobId,
        result: Result<BoxedAny, Failure>,
        after: &mut Vec<AfterOp>,
    ) {
        let Some(rec) = arena.jobs.get_mut(&id) else {
            return;
        };
        let cancelling = rec.shared.state() == JobState::Cancelling || rec.pending_cancel.is_some();
        if cancelling {
            let cause = rec
                .pending_cancel
                .take()
                .or_else(|| rec.cancel_cause.clone())
                .unwrap_or_else(CancelCause::scope_closed);
            rec.shared.advance(JobState::Cancelling);
            if rec.children.is_empty() {
                self.finalize_locked(arena, id, Terminal::Cancelled(cause), after);
            } else {
                rec.cancel_cause = Some(cause);
            }
            return;
        }
        if rec.children.is_empty() {
            let terminal = match result {
                Ok(v) => Terminal::Completed(v),
                Err(e) => Terminal::Failed(e),
            };
            self.finalize_locked(arena, id, terminal, after);
        } else {
            // Implicit join: a job never completes while a child is
            // non-terminal.
            rec.shared.advance(JobState::Completing);
            rec.body_result = Some(result);
            trace!(job = %id, children = rec.children.len(), "body done, completing");
        }
    }

    // ------------------------------------------------------------------
    // Wait registration
    // ------------------------------------------------------------------

    fn register_wait_locked(
        self: &Arc<Self>,
        arena: &mut Arena,
        id: JobId,
        target: WaitTarget,
        after: &mut Vec<AfterOp>,
    ) {
        match target {
            WaitTarget::Join(h) => self.register_on_locked(arena, id, h, AwaitKind::Join, after),
            WaitTarget::Await(h) => self.register_on_locked(arena, id, h, AwaitKind::Await, after),
            WaitTarget::AwaitAll(members) => {
                self.register_all_locked(arena, id, members, after);
            }
            WaitTarget::Switch { dispatcher, body } => {
                let Some(rec) = arena.jobs.get_mut(&id) else {
                    return;
                };
                rec.frames.push(Frame {
                    cont: Some(body),
                    dispatcher,
                });
                self.submit_input_locked(arena, id, StepInput::Start, after);
            }
            WaitTarget::Sleep(duration) => {
                let Some(rec) = arena.jobs.get_mut(&id) else {
                    return;
                };
                rec.epoch += 1;
                rec.wait = WaitState::External;
                let handle = SourceHandle {
                    runtime: Arc::downgrade(self),
                    job: id,
                    epoch: rec.epoch,
                };
                after.push(AfterOp::Sleep(duration, handle));
            }
            WaitTarget::External(registration) => {
                let Some(rec) = arena.jobs.get_mut(&id) else {
                    return;
                };
                rec.epoch += 1;
                rec.wait = WaitState::External;
                let handle = SourceHandle {
                    runtime: Arc::downgrade(self),
                    job: id,
                    epoch: rec.epoch,
                };
                after.push(AfterOp::Register(registration, handle));
            }
        }
    }

    fn register_on_locked(
        self: &Arc<Self>,
        arena: &mut Arena,
        id: JobId,
        target: JobHandle,
        kind: AwaitKind,
        after: &mut Vec<AfterOp>,
    ) {
        // Terminal targets resume immediately; state is stable under the
        // arena lock.
        if target.state().is_terminal() {
            let resumed = match kind {
                AwaitKind::Join => target.shared().join_result().map(|_| value(())),
                _ => target.shared().take_result(),
            };
            self.submit_input_locked(arena, id, StepInput::Resume(resumed), after);
            return;
        }
        let epoch = {
            let Some(rec) = arena.jobs.get_mut(&id) else {
                return;
            };
            rec.epoch += 1;
            rec.wait = WaitState::On { kind };
            rec.epoch
        };
        if let Some(trec) = arena.jobs.get_mut(&target.id()) {
            trec.waiters.push(Waiter {
                job: id,
                epoch,
                kind,
            });
        } else {
            // Record gone but state not yet observed terminal: resolve via
            // the shared block.
            let resumed = match kind {
                AwaitKind::Join => target.shared().join_result().map(|_| value(())),
                _ => target.shared().take_result(),
            };
            if let Some(rec) = arena.jobs.get_mut(&id) {
                rec.wait = WaitState::None;
            }
            self.submit_input_locked(arena, id, StepInput::Resume(resumed), after);
        }
    }

    fn register_all_locked(
        self: &Arc<Self>,
        arena: &mut Arena,
        id: JobId,
        members: Vec<JobHandle>,
        after: &mut Vec<AfterOp>,
    ) {
        // First failure among already-terminal members wins immediately.
        let mut first_err: Option<(TaskError, Arc<str>)> = None;
        let mut remaining = 0usize;
        for member in &members {
            if member.state().is_terminal() {
                if first_err.is_none() {
                    if let Err(e) = member.shared().join_result() {
                        first_err = Some((e, member.name().into()));
                    }
                }
            } else {
                remaining += 1;
            }
        }

        if let Some((err, name)) = first_err {
            for member in &members {
                if !member.state().is_terminal() {
                    self.cancel_tree_locked(
                        arena,
                        member.id(),
                        CancelCause::sibling_failure(&name),
                        after,
                    );
                }
            }
            self.submit_input_locked(arena, id, StepInput::Resume(Err(err)), after);
            return;
        }

        if remaining == 0 {
            let resumed = Self::collect_all(&members);
            self.submit_input_locked(arena, id, StepInput::Resume(resumed), after);
            return;
        }

        let epoch = {
            let Some(rec) = arena.jobs.get_mut(&id) else {
                return;
            };
            rec.epoch += 1;
            rec.wait = WaitState::All {
                members: members.clone(),
                remaining,
            };
            rec.epoch
        };
        for member in &members {
            if let Some(trec) = arena.jobs.get_mut(&member.id()) {
                trec.waiters.push(Waiter {
                    job: id,
                    epoch,
                    kind: AwaitKind::AllMember,
                });
            }
        }
    }

    /// Take all member values, in member order.
    fn collect_all(members: &[JobHandle]) -> Result<BoxedAny, TaskError> {
        let mut values: Vec<BoxedAny> = Vec::with_capacity(members.len());
        for member in members {
            values.push(member.shared().take_result()?);
        }
        Ok(value(values))
    }

    // ------------------------------------------------------------------
    // Resumption
    // ------------------------------------------------------------------

    /// Deliver an external source's completion. Ignored if the job has
    /// moved on (epoch mismatch); one-shot semantics are enforced here.
    pub(crate) fn resume_external(
        self: &Arc<Self>,
        id: JobId,
        epoch: u64,
        result: Result<BoxedAny, Failure>,
    ) {
        let mut after = Vec::new();
        {
            let mut arena = self.arena.lock();
            let Some(rec) = arena.jobs.get_mut(&id) else {
                return;
            };
            if rec.epoch != epoch || !matches!(rec.wait, WaitState::External) {
                trace!(job = %id, "stale external completion ignored");
                return;
            }
            rec.wait = WaitState::None;
            let input = StepInput::Resume(result.map_err(TaskError::Failed));
            self.submit_input_locked(&mut arena, id, input, &mut after);
        }
        self.run_after(after);
    }

    /// Submit the next input for a job to its topmost frame's dispatcher,
    /// never the thread that delivered the completion.
    fn submit_input_locked(
        self: &Arc<Self>,
        arena: &mut Arena,
        id: JobId,
        input: StepInput,
        after: &mut Vec<AfterOp>,
    ) {
        let Some(rec) = arena.jobs.get(&id) else {
            return;
        };
        let dispatcher = rec
            .frames
            .last()
            .map(|f| f.dispatcher.clone())
            .unwrap_or_else(|| rec.dispatcher.clone());
        let rt = self.clone();
        if let Err(err) = dispatcher.submit(Box::new(move || rt.step_job(id, input))) {
            warn!(job = %id, %err, "resubmission rejected; job fails");
            self.finalize_locked(arena, id, Terminal::Rejected(err), after);
        }
    }

    // ------------------------------------------------------------------
    // Finalization
    // ------------------------------------------------------------------

    fn finalize_locked(
        self: &Arc<Self>,
        arena: &mut Arena,
        id: JobId,
        terminal: Terminal,
        after: &mut Vec<AfterOp>,
    ) {
        let Some(rec) = arena.jobs.remove(&id) else {
            return;
        };
        let (state, outcome, failure) = match terminal {
            Terminal::Completed(v) => (JobState::Completed, Outcome::Success(v), None),
            Terminal::Failed(f) => (JobState::Failed, Outcome::Failed(f.clone()), Some(f)),
            Terminal::Cancelled(c) => (JobState::Cancelled, Outcome::Cancelled(c), None),
            Terminal::Rejected(e) => (
                JobState::Failed,
                Outcome::Rejected(e.clone()),
                Some(Failure::new(e)),
            ),
        };
        if !rec.shared.finalize(state, outcome) {
            return; // already terminal
        }
        self.stats.record_terminal(state);
        match state {
            JobState::Cancelled => trace!(job = %id, name = %rec.shared.name(), "job cancelled"),
            JobState::Completed => trace!(job = %id, name = %rec.shared.name(), "job completed"),
            _ => debug!(job = %id, name = %rec.shared.name(), "job failed"),
        }

        // Wake suspended waiters.
        for waiter in rec.waiters.iter() {
            self.notify_waiter_locked(arena, waiter, &rec.shared, after);
        }

        // Normal paths finalize childless; a dispatch rejection can take a
        // job down with children still live. They go with it.
        if !rec.children.is_empty() {
            let cause = rec
                .cancel_cause
                .clone()
                .unwrap_or_else(CancelCause::scope_closed);
            for child in rec.children.iter() {
                self.cancel_tree_locked(arena, *child, CancelCause::parent(&cause), after);
            }
        }

        // Unhandled launch failures surface to the scope: fail-fast sibling
        // cancellation, then exactly one handler. Async failures are held
        // in the outcome slot for await; cancellations reach no handler.
        if let Some(failure) = failure {
            if rec.kind == JobKind::Launch {
                self.propagate_failure_locked(
                    arena,
                    rec.parent,
                    rec.shared.name(),
                    failure,
                    rec.on_failure.clone(),
                    after,
                );
            }
        }

        // Detach from the parent; a Completing parent with no children
        // left finalizes now.
        if let Some(pid) = rec.parent {
            let parent_ready = {
                let Some(prec) = arena.jobs.get_mut(&pid) else {
                    return;
                };
                prec.children.retain(|c| *c != id);
                prec.children.is_empty()
                    && prec.frames.is_empty()
                    && !prec.stepping
                    && !prec.unwinding
            };
            if parent_ready {
                self.maybe_finalize_childless_locked(arena, pid, after);
            }
        }
    }

    /// Finalize a body-finished or closing job whose last child detached.
    fn maybe_finalize_childless_locked(
        self: &Arc<Self>,
        arena: &mut Arena,
        id: JobId,
        after: &mut Vec<AfterOp>,
    ) {
        let terminal = {
            let Some(rec) = arena.jobs.get_mut(&id) else {
                return;
            };
            match rec.shared.state() {
                JobState::Cancelling => {
                    let cause = rec
                        .cancel_cause
                        .clone()
                        .unwrap_or_else(CancelCause::scope_closed);
                    match rec.scope_failure.take() {
                        // A scope brought down by a child failure reports
                        // that failure, not a bare cancellation.
                        Some(f) => Terminal::Failed(f),
                        None => Terminal::Cancelled(cause),
                    }
                }
                JobState::Completing => match rec.body_result.take() {
                    Some(Ok(v)) => Terminal::Completed(v),
                    Some(Err(e)) => Terminal::Failed(e),
                    None => Terminal::Completed(value(())),
                },
                _ => return, // Active scope root keeps living
            }
        };
        self.finalize_locked(arena, id, terminal, after);
    }

    fn notify_waiter_locked(
        self: &Arc<Self>,
        arena: &mut Arena,
        waiter: &Waiter,
        target: &Arc<JobShared>,
        after: &mut Vec<AfterOp>,
    ) {
        let Some(wrec) = arena.jobs.get_mut(&waiter.job) else {
            return;
        };
        if wrec.epoch != waiter.epoch {
            return; // stale registration
        }
        match (&mut wrec.wait, waiter.kind) {
            (WaitState::On { kind }, AwaitKind::Join | AwaitKind::Await)
                if *kind == waiter.kind =>
            {
                wrec.wait = WaitState::None;
                let resumed = match waiter.kind {
                    AwaitKind::Join => target.join_result().map(|_| value(())),
                    _ => target.take_result(),
                };
                self.submit_input_locked(arena, waiter.job, StepInput::Resume(resumed), after);
            }
            (
                WaitState::All {
                    members: _,
                    remaining,
                },
                AwaitKind::AllMember,
            ) => {
                if let Err(err) = target.join_result() {
                    // Fail-fast: first member failure resumes the awaiter
                    // and cancels the remaining members.
                    let members = match std::mem::replace(&mut wrec.wait, WaitState::None) {
                        WaitState::All { members, .. } => members,
                        _ => unreachable!(),
                    };
                    let name: Arc<str> = target.name().into();
                    for member in &members {
                        if !member.state().is_terminal() {
                            self.cancel_tree_locked(
                                arena,
                                member.id(),
                                CancelCause::sibling_failure(&name),
                                after,
                            );
                        }
                    }
                    self.submit_input_locked(arena, waiter.job, StepInput::Resume(Err(err)), after);
                } else {
                    *remaining -= 1;
                    if *remaining == 0 {
                        let members = match std::mem::replace(&mut wrec.wait, WaitState::None) {
                            WaitState::All { members, .. } => members,
                            _ => unreachable!(),
                        };
                        let resumed = Self::collect_all(&members);
                        self.submit_input_locked(
                            arena,
                            waiter.job,
                            StepInput::Resume(resumed),
                            after,
                        );
                    }
                }
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Failure propagation
    // ------------------------------------------------------------------

    fn propagate_failure_locked(
        self: &Arc<Self>,
        arena: &mut Arena,
        parent: Option<JobId>,
        failed_name: &str,
        failure: Failure,
        job_handler: Option<FailureHandler>,
        after: &mut Vec<AfterOp>,
    ) {
        // Walk up to the owning scope root.
        let mut cursor = parent;
        let mut root = None;
        while let Some(pid) = cursor {
            match arena.jobs.get(&pid) {
                Some(rec) if rec.kind == JobKind::ScopeRoot => {
                    root = Some(pid);
                    break;
                }
                Some(rec) => cursor = rec.parent,
                None => break,
            }
        }

        let mut scope_handler = None;
        if let Some(rid) = root {
            let fail_fast = match arena.jobs.get_mut(&rid) {
                Some(rec) => {
                    scope_handler = rec.on_failure.clone();
                    if rec.policy == FailurePolicy::FailFast {
                        rec.scope_failure.get_or_insert_with(|| failure.clone());
                        true
                    } else {
                        false
                    }
                }
                None => false,
            };
            if fail_fast {
                debug!(scope = %rid, job = failed_name, "failure propagates: cancelling scope tree");
                self.cancel_tree_locked(
                    arena,
                    rid,
                    CancelCause::sibling_failure(failed_name),
                    after,
                );
            }
        }

        match job_handler.or(scope_handler).or_else(default_failure_handler) {
            Some(handler) => after.push(AfterOp::Handler(handler, failed_name.into(), failure)),
            None => {
                error!(job = failed_name, %failure, "unhandled task failure");
            }
        }
    }

    // ------------------------------------------------------------------
    // Deferred side effects
    // ------------------------------------------------------------------

    fn run_after(self: &Arc<Self>, ops: Vec<AfterOp>) {
        let mut queue = ops;
        while let Some(op) = queue.pop() {
            match op {
                AfterOp::Handler(handler, name, failure) => handler(&name, &failure),
                AfterOp::Register(registration, handle) => registration(handle),
                AfterOp::Sleep(duration, handle) => self.timer.schedule(duration, handle),
                AfterOp::Unwind {
                    job,
                    frames,
                    cause,
                    cx,
                } => {
                    // Deliver the signal to the remaining frames, innermost
                    // first, so scoped cleanup runs, then finalize.
                    for frame in frames.into_iter().rev() {
                        if let Some(mut cont) = frame.cont {
                            let cause = cause.clone();
                            let cx = cx.clone();
                            let _ = catch_unwind(AssertUnwindSafe(move || {
                                cont.step(&cx, StepInput::Cancel(cause))
                            }));
                        }
                    }
                    let mut arena = self.arena.lock();
                    let mut more = Vec::new();
                    let children_empty = match arena.jobs.get_mut(&job) {
                        Some(rec) => {
                            rec.unwinding = false;
                            rec.children.is_empty()
                        }
                        None => false,
                    };
                    if children_empty {
                        self.finalize_locked(
                            &mut arena,
                            job,
                            Terminal::Cancelled(cause),
                            &mut more,
                        );
                    }
                    drop(arena);
                    queue.extend(more);
                }
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.timer.shutdown();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("live_jobs", &self.live_jobs())
            .finish()
    }
}

/// Per-step context handed to a continuation. Context is passed
/// explicitly; there is no ambient "current scope".
#[derive(Clone)]
pub struct TaskCx {
    runtime: Arc<Runtime>,
    job: JobId,
    shared: Arc<JobShared>,
}

impl TaskCx {
    /// The running job's ID.
    #[inline]
    pub fn job_id(&self) -> JobId {
        self.job
    }

    /// The running job's name.
    #[inline]
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// Whether cancellation of this job has been requested.
    #[inline]
    pub fn is_cancelling(&self) -> bool {
        self.shared.state() == JobState::Cancelling
    }

    /// Handle to the running job.
    pub fn handle(&self) -> JobHandle {
        JobHandle::new(self.job, self.shared.clone(), Arc::downgrade(&self.runtime))
    }

    /// The runtime this job runs on.
    #[inline]
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Launch a fire-and-forget child of the running job.
    pub fn launch(
        &self,
        ctx: TaskContext,
        body: impl Continuation + 'static,
    ) -> Result<JobHandle, DispatchError> {
        self.runtime
            .launch_job(self.job, ctx, Box::new(body), JobKind::Launch)
    }

    /// Start a deferred-producing child of the running job (the async
    /// builder). Its failure is held until awaited.
    pub fn spawn<T>(
        &self,
        ctx: TaskContext,
        body: impl Continuation + 'static,
    ) -> Result<Deferred<T>, DispatchError> {
        let handle = self
            .runtime
            .launch_job(self.job, ctx, Box::new(body), JobKind::Async)?;
        Ok(Deferred::new(handle))
    }
}

impl std::fmt::Debug for TaskCx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCx")
            .field("job", &self.job)
            .field("name", &self.name())
            .finish()
    }
}

/// Single-shot completion handle for an external asynchronous source.
///
/// Bridges network/disk/timer callbacks into suspension points: the source
/// calls [`complete`](SourceHandle::complete) exactly once with a value or
/// failure. Late or duplicate completions (after cancellation or a
/// previous delivery) are ignored.
pub struct SourceHandle {
    runtime: Weak<Runtime>,
    job: JobId,
    epoch: u64,
}

impl SourceHandle {
    /// Deliver the source's result, resuming the suspended job on its own
    /// dispatcher.
    pub fn complete(self, result: Result<BoxedAny, Failure>) {
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.resume_external(self.job, self.epoch, result);
        }
    }

    /// The suspended job's ID.
    #[inline]
    pub fn job_id(&self) -> JobId {
        self.job
    }
}

impl std::fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceHandle")
            .field("job", &self.job)
            .field("epoch", &self.epoch)
            .finish()
    }
}
