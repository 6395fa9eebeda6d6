//! Execution context: the immutable, composable bag of per-job elements.
//!
//! Merging overrides element-wise. The Job element is deliberately absent
//! from the bag: a fresh job is always generated for each child and can
//! never be injected or inherited by override.

use std::sync::Arc;

use crate::dispatch::DispatcherHandle;
use crate::error::Failure;

/// Handler invoked for unhandled computation failures.
///
/// Receives the failing job's name and the failure. Cancellations never
/// reach a failure handler.
pub type FailureHandler = Arc<dyn Fn(&str, &Failure) + Send + Sync>;

/// Context elements applied to a launched job. Unset elements are
/// inherited from the parent at launch time.
#[derive(Clone, Default)]
pub struct TaskContext {
    dispatcher: Option<DispatcherHandle>,
    name: Option<Arc<str>>,
    on_failure: Option<FailureHandler>,
}

impl TaskContext {
    /// Empty context: everything inherited.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the dispatcher.
    pub fn with_dispatcher(mut self, dispatcher: DispatcherHandle) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Name the job, for diagnostics.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into().into());
        self
    }

    /// Override the failure handler.
    pub fn with_failure_handler(mut self, handler: FailureHandler) -> Self {
        self.on_failure = Some(handler);
        self
    }

    /// Merge `overrides` on top of `self`: set elements in `overrides`
    /// win, element by element.
    pub fn merge(&self, overrides: &TaskContext) -> TaskContext {
        TaskContext {
            dispatcher: overrides
                .dispatcher
                .clone()
                .or_else(|| self.dispatcher.clone()),
            name: overrides.name.clone().or_else(|| self.name.clone()),
            on_failure: overrides
                .on_failure
                .clone()
                .or_else(|| self.on_failure.clone()),
        }
    }

    /// The dispatcher override, if any.
    #[inline]
    pub fn dispatcher(&self) -> Option<&DispatcherHandle> {
        self.dispatcher.as_ref()
    }

    /// The name override, if any.
    #[inline]
    pub fn name(&self) -> Option<&Arc<str>> {
        self.name.as_ref()
    }

    /// The failure handler override, if any.
    #[inline]
    pub fn failure_handler(&self) -> Option<&FailureHandler> {
        self.on_failure.as_ref()
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field(
                "dispatcher",
                &self.dispatcher.as_ref().map(|d| d.name().to_string()),
            )
            .field("name", &self.name)
            .field("has_failure_handler", &self.on_failure.is_some())
            .finish()
    }
}
