//! Weft: structured concurrency for thread-backed task trees.
//!
//! Tasks are organized into scope-owned trees: a [`Scope`] owns every job
//! launched inside it, parents outlive children, cancellation flows
//! top-down, and failures flow bottom-up. Execution happens on pluggable
//! [`dispatchers`](dispatch); task bodies are [`continuations`](continuation)
//! stepped by a trampoline, so a suspended task holds no thread.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use weft::{
//!     run_once, value, FailurePolicy, PoolDispatcher, Runtime, TaskContext,
//! };
//!
//! let runtime = Runtime::new();
//! let pool: weft::DispatcherHandle = Arc::new(PoolDispatcher::cpu("default"));
//! let scope = runtime.open_scope(pool, FailurePolicy::FailFast, TaskContext::new());
//!
//! let job = scope
//!     .launch(TaskContext::new().named("greeter"), run_once(|_cx| {
//!         tracing::info!("hello from a task");
//!         Ok(value(()))
//!     }))
//!     .unwrap();
//!
//! job.join().unwrap();
//! scope.close().wait();
//! ```

#![doc(html_root_url = "https://docs.rs/weft")]
#![warn(rust_2018_idioms)]

// Public modules
pub mod context;
pub mod continuation;
pub mod deferred;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod scheduler;
pub mod scope;

mod time;

// Utility modules
pub mod util;

// Re-exports
pub use anyhow::{Context, Result};
pub use thiserror::Error;

pub use context::{FailureHandler, TaskContext};
pub use continuation::{
    await_all, run_once, sleep, value, with_context, Continuation, FnJob, StageOut, Stages,
    StepInput, StepOutput, WaitTarget,
};
pub use deferred::Deferred;
pub use dispatch::{
    Dispatch, DispatcherHandle, ElasticDispatcher, PoolDispatcher, SerialDispatcher,
};
pub use error::{CancelCause, CancelKind, DispatchError, Failure, TaskError};
pub use job::{JobHandle, JobId, JobKind, JobState};
pub use scheduler::{
    clear_default_failure_handler, set_default_failure_handler, Runtime, SourceHandle, TaskCx,
};
pub use scope::{CloseHandle, FailurePolicy, Scope};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
