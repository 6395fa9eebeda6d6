//! Elastic pool for I/O-bound work.
//!
//! Workers are spawned on demand up to a cap and retire after an idle
//! keep-alive. A worker that dequeues work while a backlog remains and no
//! sibling is idle spawns a helper first, so tasks that park their thread
//! on external I/O cannot starve the queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{Dispatch, Runnable};
use crate::error::DispatchError;

struct ElasticState {
    live: usize,
    idle: usize,
    shutdown: bool,
}

struct Inner {
    name: String,
    rx: Receiver<Runnable>,
    state: Mutex<ElasticState>,
    max_workers: usize,
    keep_alive: Duration,
    worker_seq: AtomicUsize,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

/// Elastic dispatcher: grows up to `max_workers`, idle threads retire.
pub struct ElasticDispatcher {
    tx: Mutex<Option<Sender<Runnable>>>,
    inner: Arc<Inner>,
}

impl ElasticDispatcher {
    /// Create an elastic dispatcher with the given worker cap and idle
    /// keep-alive.
    pub fn new(name: impl Into<String>, max_workers: usize, keep_alive: Duration) -> Self {
        let (tx, rx) = unbounded::<Runnable>();
        let inner = Arc::new(Inner {
            name: name.into(),
            rx,
            state: Mutex::new(ElasticState {
                live: 0,
                idle: 0,
                shutdown: false,
            }),
            max_workers: max_workers.max(1),
            keep_alive,
            worker_seq: AtomicUsize::new(0),
            workers: Mutex::new(Vec::new()),
        });
        Self {
            tx: Mutex::new(Some(tx)),
            inner,
        }
    }

    /// Elastic dispatcher with defaults suitable for blocking I/O bridges.
    pub fn io(name: impl Into<String>) -> Self {
        Self::new(name, 64, Duration::from_secs(10))
    }

    /// Number of currently live workers (diagnostics).
    pub fn live_workers(&self) -> usize {
        self.inner.state.lock().live
    }

    fn maybe_grow(inner: &Arc<Inner>) {
        let spawn = {
            let mut state = inner.state.lock();
            if state.shutdown || state.live >= inner.max_workers {
                false
            } else if state.idle == 0 || (!inner.rx.is_empty() && state.idle < inner.rx.len()) {
                state.live += 1;
                true
            } else {
                false
            }
        };
        if !spawn {
            return;
        }

        let id = inner.worker_seq.fetch_add(1, Ordering::Relaxed);
        let thread_name = format!("{}-worker-{id}", inner.name);
        let inner2 = inner.clone();
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || Self::worker_loop(inner2))
            .expect("failed to spawn dispatcher worker");
        let mut workers = inner.workers.lock();
        // Retired workers leave finished handles behind; reap them so the
        // list tracks live threads, not historical churn.
        workers.retain(|h| !h.is_finished());
        workers.push(handle);
        trace!(dispatcher = %inner.name, "elastic worker spawned");
    }

    fn worker_loop(inner: Arc<Inner>) {
        loop {
            inner.state.lock().idle += 1;
            let msg = inner.rx.recv_timeout(inner.keep_alive);
            inner.state.lock().idle -= 1;

            match msg {
                Ok(work) => {
                    // Hand off before possibly parking this thread.
                    if !inner.rx.is_empty() {
                        Self::maybe_grow(&inner);
                    }
                    work();
                }
                Err(RecvTimeoutError::Timeout) => {
                    let mut state = inner.state.lock();
                    if state.live > 1 || state.shutdown {
                        state.live -= 1;
                        trace!(dispatcher = %inner.name, "elastic worker retiring");
                        return;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    inner.state.lock().live -= 1;
                    return;
                }
            }
        }
    }

    /// Stop accepting work and join all workers. Idempotent.
    pub fn shutdown(&self) {
        let tx = self.tx.lock().take();
        if tx.is_none() {
            return;
        }
        self.inner.state.lock().shutdown = true;
        drop(tx);
        let workers = std::mem::take(&mut *self.inner.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
        debug!(dispatcher = %self.inner.name, "elastic dispatcher shut down");
    }
}

impl Dispatch for ElasticDispatcher {
    fn submit(&self, work: Runnable) -> Result<(), DispatchError> {
        {
            let guard = self.tx.lock();
            let Some(tx) = guard.as_ref() else {
                return Err(DispatchError::Shutdown {
                    dispatcher: self.inner.name.clone(),
                });
            };
            if tx.send(work).is_err() {
                return Err(DispatchError::Shutdown {
                    dispatcher: self.inner.name.clone(),
                });
            }
        }
        Self::maybe_grow(&self.inner);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.inner.name
    }
}

impl Drop for ElasticDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ElasticDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ElasticDispatcher")
            .field("name", &self.inner.name)
            .field("live", &state.live)
            .field("idle", &state.idle)
            .field("max_workers", &self.inner.max_workers)
            .finish()
    }
}
