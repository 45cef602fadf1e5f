//! Error types for the task engine.
//!
//! Two families: [`LoopError`] covers loop and API misuse (no loop
//! installed, frozen dependency set, ...), while [`TaskAborted`] is the
//! value observers receive when a task does not finish successfully.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use crate::task::{TaskRef, TaskState};

/// Result type returned by task bodies, hooks, and background handlers.
pub type TaskResult = anyhow::Result<()>;

/// Errors raised by the task loop and the task API.
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("a task loop is already installed")]
    AlreadyInstalled,

    #[error("no task loop is currently active")]
    NotInstalled,

    #[error("no task is currently active")]
    NoCurrentTask,

    #[error("cannot add dependencies after the task has started (state: {state})")]
    DependenciesFrozen { state: TaskState },

    #[error("cannot change lease usage after the task is prepared (state: {state})")]
    LeaseFrozen { state: TaskState },

    #[error("cannot create child tasks before the parent task is running (state: {state})")]
    ParentNotRunning { state: TaskState },

    #[error("background handlers can only be created for running or waiting tasks (state: {state})")]
    TaskNotRunning { state: TaskState },

    #[error("context variable {name} is not set")]
    ContextVarNotSet { name: &'static str },

    #[error("failed to build the task loop runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error(transparent)]
    RootAborted(#[from] TaskAborted),
}

/// Classification of a task abort, from the observer's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortKind {
    /// The task itself was cancelled, directly or by an ancestor.
    Cancelled,
    /// The task raised an uncaught error.
    Failed,
    /// A dependency of the observer was cancelled.
    DependencyCancelled,
    /// A dependency of the observer failed.
    DependencyFailed,
    /// A child of the observer was cancelled.
    ChildCancelled,
    /// A child of the observer failed.
    ChildFailed,
}

impl AbortKind {
    /// Whether this abort is a flavour of cancellation.
    pub fn is_cancellation(self) -> bool {
        matches!(
            self,
            AbortKind::Cancelled | AbortKind::DependencyCancelled | AbortKind::ChildCancelled
        )
    }

    /// Whether this abort is a flavour of failure.
    pub fn is_failure(self) -> bool {
        !self.is_cancellation()
    }
}

/// The underlying cause of an abort, when there is one.
#[derive(Debug, Clone)]
pub enum AbortCause {
    /// An error raised by user code.
    Error(Arc<anyhow::Error>),
    /// Another abort further down the propagation chain.
    Abort(Arc<TaskAborted>),
}

impl AbortCause {
    /// The cause as a standard error, for chain traversal.
    pub fn as_std_error(&self) -> &(dyn StdError + 'static) {
        match self {
            AbortCause::Error(err) => {
                let err: &anyhow::Error = err;
                err.as_ref()
            }
            AbortCause::Abort(abort) => abort.as_ref(),
        }
    }
}

/// The outcome observers receive when a task does not finish
/// successfully.
///
/// Carries the affected task's identity and, for failures, the cause
/// chain down to the original error.
#[derive(Debug, Clone)]
pub struct TaskAborted {
    kind: AbortKind,
    task: TaskRef,
    cause: Option<AbortCause>,
}

impl TaskAborted {
    pub(crate) fn cancelled(task: TaskRef) -> Self {
        Self { kind: AbortKind::Cancelled, task, cause: None }
    }

    pub(crate) fn failed(task: TaskRef, cause: AbortCause) -> Self {
        Self { kind: AbortKind::Failed, task, cause: Some(cause) }
    }

    pub(crate) fn dependency_cancelled(dependency: TaskRef) -> Self {
        Self { kind: AbortKind::DependencyCancelled, task: dependency, cause: None }
    }

    pub(crate) fn dependency_failed(dependency: TaskRef, cause: AbortCause) -> Self {
        Self { kind: AbortKind::DependencyFailed, task: dependency, cause: Some(cause) }
    }

    pub(crate) fn child_cancelled(child: TaskRef) -> Self {
        Self { kind: AbortKind::ChildCancelled, task: child, cause: None }
    }

    pub(crate) fn child_failed(child: TaskRef, cause: AbortCause) -> Self {
        Self { kind: AbortKind::ChildFailed, task: child, cause: Some(cause) }
    }

    /// How the abort is classified.
    pub fn kind(&self) -> AbortKind {
        self.kind
    }

    /// Identity of the task the classification refers to (the observer
    /// itself for `Cancelled`/`Failed`, the source for the rest).
    pub fn task(&self) -> &TaskRef {
        &self.task
    }

    /// The cause of the abort, if there is one.
    pub fn cause(&self) -> Option<&AbortCause> {
        self.cause.as_ref()
    }

    /// Whether this abort is a flavour of cancellation.
    pub fn is_cancellation(&self) -> bool {
        self.kind.is_cancellation()
    }
}

impl fmt::Display for TaskAborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            AbortKind::Cancelled => write!(f, "task {} cancelled", self.task),
            AbortKind::Failed => write!(f, "task {} failed", self.task),
            AbortKind::DependencyCancelled => write!(f, "dependency {} cancelled", self.task),
            AbortKind::DependencyFailed => write!(f, "dependency {} failed", self.task),
            AbortKind::ChildCancelled => write!(f, "child task {} cancelled", self.task),
            AbortKind::ChildFailed => write!(f, "child task {} failed", self.task),
        }
    }
}

impl StdError for TaskAborted {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_ref().map(AbortCause::as_std_error)
    }
}
