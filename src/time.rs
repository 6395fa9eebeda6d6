//! Timer wheel backing sleep suspensions.
//!
//! One dedicated thread sleeps until the earliest deadline and completes
//! the corresponding source handles. Cancellation needs no timer surgery:
//! a fired handle whose job has moved on is ignored by the epoch check.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::continuation::value;
use crate::scheduler::SourceHandle;

struct Entry {
    at: Instant,
    seq: u64,
    handle: Option<SourceHandle>,
}

// Min-heap by deadline; seq breaks ties in arrival order.
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerState {
    queue: BinaryHeap<Entry>,
    seq: u64,
    shutdown: bool,
}

struct Shared {
    state: Mutex<TimerState>,
    wake: Condvar,
}

/// Deadline queue with a single worker thread.
pub(crate) struct Timer {
    shared: std::sync::Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Timer {
    pub(crate) fn new() -> Self {
        let shared = std::sync::Arc::new(Shared {
            state: Mutex::new(TimerState {
                queue: BinaryHeap::new(),
                seq: 0,
                shutdown: false,
            }),
            wake: Condvar::new(),
        });
        let shared2 = shared.clone();
        let thread = thread::Builder::new()
            .name("weft-timer".into())
            .spawn(move || Self::run(shared2))
            .expect("failed to spawn timer thread");
        Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Schedule `handle` to complete with `()` after `duration`.
    pub(crate) fn schedule(&self, duration: Duration, handle: SourceHandle) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return;
        }
        let seq = state.seq;
        state.seq += 1;
        trace!(job = %handle.job_id(), ?duration, "sleep scheduled");
        state.queue.push(Entry {
            at: Instant::now() + duration,
            seq,
            handle: Some(handle),
        });
        self.shared.wake.notify_one();
    }

    /// Stop the worker and drop pending deadlines. Idempotent.
    pub(crate) fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.queue.clear();
        }
        self.shared.wake.notify_one();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }

    fn run(shared: std::sync::Arc<Shared>) {
        let mut state = shared.state.lock();
        loop {
            if state.shutdown {
                return;
            }
            let now = Instant::now();
            match state.queue.peek() {
                Some(entry) if entry.at <= now => {
                    let mut entry = match state.queue.pop() {
                        Some(entry) => entry,
                        None => continue,
                    };
                    let handle = entry.handle.take();
                    // Completion resubmits to a dispatcher; never hold the
                    // timer lock across it.
                    drop(state);
                    if let Some(handle) = handle {
                        handle.complete(Ok(value(())));
                    }
                    state = shared.state.lock();
                }
                Some(entry) => {
                    let deadline = entry.at;
                    let _ = shared.wake.wait_until(&mut state, deadline);
                }
                None => {
                    shared.wake.wait(&mut state);
                }
            }
        }
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Timer")
            .field("pending", &state.queue.len())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}
