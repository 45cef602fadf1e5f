//! Task construction.

use std::future::Future;
use std::rc::Rc;

use futures::FutureExt;
use futures::future::LocalBoxFuture;

use super::{Task, TaskCore, TaskState, spawn_driver};
use crate::error::{LoopError, TaskResult};
use crate::runloop::current_task;

pub(crate) type AsyncHook = Box<dyn FnOnce(Task) -> LocalBoxFuture<'static, TaskResult>>;
pub(crate) type SyncHook = Box<dyn FnOnce(Task)>;

/// The four optional user hooks of a task.
#[derive(Default)]
pub(crate) struct Hooks {
    pub(crate) on_prepare: Option<AsyncHook>,
    pub(crate) on_run: Option<AsyncHook>,
    pub(crate) on_cancel: Option<SyncHook>,
    pub(crate) on_cleanup: Option<SyncHook>,
}

/// Builder for a task spawned as a child of the current task.
///
/// `on_prepare` runs before the task is scheduled and is the place to
/// add dependencies; `on_run` is the task body; `on_cancel` fires on
/// cancellation of this task (not of a dependency); `on_cleanup` fires
/// once on any terminal state.
pub struct TaskBuilder {
    name: Option<String>,
    hooks: Hooks,
    use_lease: bool,
    discard: bool,
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self {
            name: None,
            hooks: Hooks::default(),
            use_lease: false,
            discard: true,
        }
    }

    /// Name the task; made unique among siblings with a `#N` suffix on
    /// collision. Defaults to `task`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn on_prepare<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce(Task) -> Fut + 'static,
        Fut: Future<Output = TaskResult> + 'static,
    {
        self.hooks.on_prepare = Some(Box::new(move |task| hook(task).boxed_local()));
        self
    }

    pub fn on_run<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce(Task) -> Fut + 'static,
        Fut: Future<Output = TaskResult> + 'static,
    {
        self.hooks.on_run = Some(Box::new(move |task| hook(task).boxed_local()));
        self
    }

    pub fn on_cancel<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(Task) + 'static,
    {
        self.hooks.on_cancel = Some(Box::new(hook));
        self
    }

    pub fn on_cleanup<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(Task) + 'static,
    {
        self.hooks.on_cleanup = Some(Box::new(hook));
        self
    }

    /// Require a lease from the loop's lease client before running.
    pub fn use_lease(mut self, use_lease: bool) -> Self {
        self.use_lease = use_lease;
        self
    }

    /// Whether the task is auto-cancelled (as `discarded`) once the last
    /// task depending on it has finished. Defaults to `true`.
    pub fn discard(mut self, discard: bool) -> Self {
        self.discard = discard;
        self
    }

    /// Create the task as a child of the current task and start its
    /// driver. The parent must be `running`.
    pub fn spawn(self) -> Result<Task, LoopError> {
        let parent = current_task()?;
        let parent_state = parent.state();
        if parent_state != TaskState::Running {
            return Err(LoopError::ParentNotRunning { state: parent_state });
        }
        let core = TaskCore::new(
            Some(Rc::downgrade(&parent.core)),
            self.hooks,
            self.use_lease,
            self.discard,
        );
        let base = self.name.as_deref().unwrap_or("task");
        parent.core.adopt(&core, base);
        let task = core.handle();
        tracing::debug!(task = %task.path(), parent = %parent.path(), "task created");
        spawn_driver(task.clone());
        Ok(task)
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}
