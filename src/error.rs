//! Error taxonomy for the runtime.
//!
//! Three families of things go wrong here and they must never be conflated:
//! cancellation (expected, cooperative), computation failure (a task body
//! raised), and dispatch rejection (the execution substrate refused work).

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Why a job was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelKind {
    /// Explicit `cancel()` call on a job or scope.
    Explicit,
    /// The owning scope was closed.
    ScopeClosed,
    /// The parent job was cancelled; cancellation propagates top-down.
    Parent,
    /// A sibling job failed under a fail-fast scope.
    SiblingFailure,
    /// Lost a timeout race.
    Timeout,
}

/// Cancellation cause carried through a job tree.
///
/// Cloneable so the same cause can be delivered to every descendant and
/// re-raised to every `join`/`await` caller. Cancellation is an expected
/// outcome and is never reported through failure handlers.
#[derive(Debug, Clone)]
pub struct CancelCause {
    kind: CancelKind,
    reason: Arc<str>,
}

impl CancelCause {
    /// Explicit cancellation with a caller-supplied reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            kind: CancelKind::Explicit,
            reason: reason.into().into(),
        }
    }

    /// The owning scope was closed.
    pub fn scope_closed() -> Self {
        Self {
            kind: CancelKind::ScopeClosed,
            reason: "scope closed".into(),
        }
    }

    /// Derived cause for children of a cancelled parent.
    pub fn parent(of: &CancelCause) -> Self {
        Self {
            kind: CancelKind::Parent,
            reason: of.reason.clone(),
        }
    }

    /// A sibling failed under a fail-fast scope.
    pub fn sibling_failure(sibling: &str) -> Self {
        Self {
            kind: CancelKind::SiblingFailure,
            reason: format!("sibling job {sibling} failed").into(),
        }
    }

    /// Lost a timeout race.
    pub fn timeout() -> Self {
        Self {
            kind: CancelKind::Timeout,
            reason: "timed out".into(),
        }
    }

    /// The cause category.
    #[inline]
    pub fn kind(&self) -> CancelKind {
        self.kind
    }

    /// Human-readable reason.
    #[inline]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

/// A computation failure raised by a task body.
///
/// Wraps an [`anyhow::Error`] behind an `Arc` so the same failure can be
/// stored write-once in a job's result slot and re-raised identically to
/// every awaiter, including a second `await` on the same deferred.
#[derive(Clone)]
pub struct Failure(Arc<anyhow::Error>);

impl Failure {
    /// Failure from any error type.
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    /// Failure from a message.
    pub fn msg(msg: impl Into<String>) -> Self {
        Self(Arc::new(anyhow::anyhow!(msg.into())))
    }

    /// Failure recovered from a panicking task body.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task body panicked".to_string()
        };
        Self(Arc::new(anyhow::anyhow!("panic: {msg}")))
    }

    /// Borrow the underlying error.
    #[inline]
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl From<anyhow::Error> for Failure {
    fn from(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let err: &(dyn std::error::Error + Send + Sync + 'static) = (*self.0).as_ref();
        Some(err)
    }
}

/// Terminal outcome of a job, as seen by `join`/`await` callers.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The job was cancelled. Distinct from failure by construction;
    /// cleanup has already run.
    #[error("cancelled: {0}")]
    Cancelled(CancelCause),

    /// The task body failed.
    #[error(transparent)]
    Failed(#[from] Failure),

    /// The job could not be (re)submitted to its dispatcher.
    #[error("dispatch rejected: {0}")]
    Rejected(#[from] DispatchError),

    /// The deferred's success value was already taken by an earlier await.
    #[error("result already consumed")]
    ResultConsumed,
}

impl TaskError {
    /// Whether this outcome is a cancellation.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled(_))
    }
}

/// A dispatcher refused new work. Surfaced synchronously to the
/// submitter, never queued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The dispatcher has been shut down.
    #[error("dispatcher {dispatcher} is shut down")]
    Shutdown { dispatcher: String },

    /// The dispatcher's bounded queue is saturated.
    #[error("dispatcher {dispatcher} queue is full (capacity {capacity})")]
    QueueFull { dispatcher: String, capacity: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_cause_carries_kind_and_reason() {
        let cause = CancelCause::new("stop now");
        assert_eq!(cause.kind(), CancelKind::Explicit);
        assert_eq!(cause.reason(), "stop now");

        let derived = CancelCause::parent(&cause);
        assert_eq!(derived.kind(), CancelKind::Parent);
        assert_eq!(derived.reason(), "stop now");
    }

    #[test]
    fn failure_clones_share_the_same_error() {
        let f = Failure::msg("boom");
        let g = f.clone();
        assert_eq!(f.to_string(), g.to_string());
    }

    #[test]
    fn failure_from_panic_payloads() {
        let f = Failure::from_panic(Box::new("oops"));
        assert!(f.to_string().contains("oops"));
        let f = Failure::from_panic(Box::new(String::from("bad")));
        assert!(f.to_string().contains("bad"));
        let f = Failure::from_panic(Box::new(42_u32));
        assert!(f.to_string().contains("panicked"));
    }

    #[test]
    fn task_error_cancelled_is_distinct() {
        let e = TaskError::Cancelled(CancelCause::scope_closed());
        assert!(e.is_cancelled());
        let e = TaskError::Failed(Failure::msg("x"));
        assert!(!e.is_cancelled());
    }
}
