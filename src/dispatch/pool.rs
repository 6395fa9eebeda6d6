//! Bounded worker pools.
//!
//! `PoolDispatcher` is a fixed-size CPU pool over a bounded crossbeam
//! channel; `SerialDispatcher` is the single-thread special case used for
//! UI-affine work, where FIFO submission order is preserved.

use std::thread;

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{Dispatch, Runnable};
use crate::error::DispatchError;

/// Fixed-size worker pool with a bounded submission queue.
///
/// Submission never blocks: a saturated queue is reported as
/// [`DispatchError::QueueFull`]. Workers drain remaining queued work on
/// shutdown before exiting.
pub struct PoolDispatcher {
    name: String,
    capacity: usize,
    tx: Mutex<Option<Sender<Runnable>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl PoolDispatcher {
    /// Create a pool with `num_workers` threads and a queue of `capacity`.
    pub fn new(name: impl Into<String>, num_workers: usize, capacity: usize) -> Self {
        let name = name.into();
        let num_workers = num_workers.max(1);
        let (tx, rx) = bounded::<Runnable>(capacity);

        let mut workers = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let rx = rx.clone();
            let thread_name = format!("{name}-worker-{worker_id}");
            let worker = thread::Builder::new()
                .name(thread_name)
                .spawn(move || Self::worker_loop(rx))
                .expect("failed to spawn dispatcher worker");
            workers.push(worker);
        }
        debug!(dispatcher = %name, workers = num_workers, "pool dispatcher started");

        Self {
            name,
            capacity,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Pool sized to the machine's available parallelism.
    pub fn cpu(name: impl Into<String>) -> Self {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::new(name, workers, 1024)
    }

    fn worker_loop(rx: Receiver<Runnable>) {
        // Disconnection means shutdown; everything already queued still runs.
        while let Ok(work) = rx.recv() {
            work();
        }
        trace!("dispatcher worker exiting");
    }

    /// Stop accepting work and join all workers. Idempotent.
    pub fn shutdown(&self) {
        let tx = self.tx.lock().take();
        if tx.is_none() {
            return;
        }
        drop(tx);
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
        debug!(dispatcher = %self.name, "pool dispatcher shut down");
    }
}

impl Dispatch for PoolDispatcher {
    fn submit(&self, work: Runnable) -> Result<(), DispatchError> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(DispatchError::Shutdown {
                dispatcher: self.name.clone(),
            });
        };
        match tx.try_send(work) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DispatchError::QueueFull {
                dispatcher: self.name.clone(),
                capacity: self.capacity,
            }),
            Err(TrySendError::Disconnected(_)) => Err(DispatchError::Shutdown {
                dispatcher: self.name.clone(),
            }),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for PoolDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for PoolDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolDispatcher")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Single-thread dispatcher with FIFO affinity, for work that must
/// serialize (the UI-thread analogue).
pub struct SerialDispatcher {
    inner: PoolDispatcher,
}

impl SerialDispatcher {
    /// Create a serial dispatcher.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: PoolDispatcher::new(name, 1, 4096),
        }
    }

    /// Stop accepting work and join the worker. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Dispatch for SerialDispatcher {
    #[inline]
    fn submit(&self, work: Runnable) -> Result<(), DispatchError> {
        self.inner.submit(work)
    }

    #[inline]
    fn name(&self) -> &str {
        self.inner.name()
    }
}

impl std::fmt::Debug for SerialDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialDispatcher")
            .field("name", &self.inner.name)
            .finish()
    }
}
