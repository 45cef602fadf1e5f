//! The task tree: lifecycle state machine, dependency and child
//! supervision, and the failure/cancellation propagator.
//!
//! Every task drives itself through its states on a dedicated local
//! future (the driver). Terminal transitions notify the parent and all
//! reverse-dependencies synchronously, which is what produces the
//! propagation cascade described in the crate docs.

mod background;
mod builder;

pub use background::BackgroundHandle;
pub(crate) use background::BackgroundSlot;
pub(crate) use builder::Hooks;
pub use builder::TaskBuilder;

use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::LocalBoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::{AbortCause, LoopError, TaskAborted, TaskResult};
use crate::event::{
    CursorMap, DynEventStream, EventKey, EventStream, TaskEvent, TaskEventExt, TaskStateChange,
};
use crate::gate::{Gate, GateOutcome};
use crate::lease::Lease;
use crate::runloop::{CURRENT_TASK, current_task_or_none};

pub(crate) type TaskId = u64;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

pub(crate) type ErrorHandler = dyn Fn(TaskAborted) -> LocalBoxFuture<'static, TaskResult>;

/// Lifecycle states of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Preparing,
    Pending,
    Running,
    Waiting,
    Done,
    Cancelled,
    Discarded,
    Failed,
}

impl TaskState {
    /// Whether the task has finished running (successfully or not).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Done | TaskState::Cancelled | TaskState::Discarded | TaskState::Failed
        )
    }

    /// Whether the task finished without completing its work.
    pub fn is_aborted(self) -> bool {
        matches!(self, TaskState::Cancelled | TaskState::Discarded | TaskState::Failed)
    }

    /// Check whether `from -> to` is an edge of the lifecycle graph.
    ///
    /// ```text
    /// preparing -> pending -> running -> waiting -> done
    /// any non-terminal -> cancelled | discarded | failed
    /// ```
    pub fn is_valid_transition(from: TaskState, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (from, to),
            (Preparing, Pending)
                | (Pending, Running)
                | (Running, Waiting)
                | (Waiting, Done)
                | (Preparing | Pending | Running | Waiting, Cancelled)
                | (Preparing | Pending | Running | Waiting, Discarded)
                | (Preparing | Pending | Running | Waiting, Failed)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Preparing => "preparing",
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Waiting => "waiting",
            TaskState::Done => "done",
            TaskState::Cancelled => "cancelled",
            TaskState::Discarded => "discarded",
            TaskState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Identity of a task as carried by abort values.
///
/// A `TaskRef` does not keep the task alive; it records which task an
/// abort refers to and where it sat in the tree at that moment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskRef {
    id: TaskId,
    path: String,
}

impl TaskRef {
    /// Dot-joined path of the task at the time the reference was taken.
    pub fn path(&self) -> &str {
        &self.path
    }

    #[cfg(test)]
    pub(crate) fn for_tests(id: TaskId, path: &str) -> Self {
        Self { id, path: path.to_string() }
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

impl PartialEq<Task> for TaskRef {
    fn eq(&self, other: &Task) -> bool {
        self.id == other.core.id
    }
}

impl PartialEq<TaskRef> for Task {
    fn eq(&self, other: &TaskRef) -> bool {
        self.core.id == other.id
    }
}

/// Shared state of one task. Public access goes through [`Task`].
pub(crate) struct TaskCore {
    pub(crate) id: TaskId,
    me: Weak<TaskCore>,
    pub(crate) name: RefCell<String>,
    pub(crate) parent: Option<Weak<TaskCore>>,
    pub(crate) state: Cell<TaskState>,
    pub(crate) discard: Cell<bool>,
    pub(crate) use_lease: Cell<bool>,

    pub(crate) children: RefCell<Vec<Rc<TaskCore>>>,
    pub(crate) child_names: RefCell<HashSet<String>>,
    pub(crate) pending_children: RefCell<Vec<TaskId>>,

    pub(crate) dependencies: RefCell<Vec<Rc<TaskCore>>>,
    pub(crate) pending_dependencies: RefCell<Vec<TaskId>>,
    pub(crate) reverse_dependencies: RefCell<Vec<Weak<TaskCore>>>,

    pub(crate) error_handlers: RefCell<HashMap<Option<TaskId>, Rc<ErrorHandler>>>,

    pub(crate) started: Gate,
    pub(crate) finished: Gate,

    pub(crate) lease: RefCell<Option<Box<dyn Lease>>>,

    pub(crate) cancel_token: CancellationToken,
    pub(crate) cancelled_by: RefCell<Option<Weak<TaskCore>>>,
    pub(crate) cleaned_up: Cell<bool>,

    pub(crate) background: RefCell<Vec<BackgroundSlot>>,
    pub(crate) drain_background: RefCell<Vec<BackgroundSlot>>,
    pub(crate) next_background_id: Cell<u64>,

    pub(crate) events: CursorMap,
    pub(crate) context: RefCell<HashMap<u64, Box<dyn Any>>>,

    pub(crate) hooks: RefCell<Hooks>,
}

impl TaskCore {
    pub(crate) fn new(
        parent: Option<Weak<TaskCore>>,
        hooks: Hooks,
        use_lease: bool,
        discard: bool,
    ) -> Rc<Self> {
        Rc::new_cyclic(|me| Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            me: me.clone(),
            name: RefCell::new(String::new()),
            parent,
            state: Cell::new(TaskState::Preparing),
            discard: Cell::new(discard),
            use_lease: Cell::new(use_lease),
            children: RefCell::new(Vec::new()),
            child_names: RefCell::new(HashSet::new()),
            pending_children: RefCell::new(Vec::new()),
            dependencies: RefCell::new(Vec::new()),
            pending_dependencies: RefCell::new(Vec::new()),
            reverse_dependencies: RefCell::new(Vec::new()),
            error_handlers: RefCell::new(HashMap::new()),
            started: Gate::new(),
            finished: Gate::new(),
            lease: RefCell::new(None),
            cancel_token: CancellationToken::new(),
            cancelled_by: RefCell::new(None),
            cleaned_up: Cell::new(false),
            background: RefCell::new(Vec::new()),
            drain_background: RefCell::new(Vec::new()),
            next_background_id: Cell::new(0),
            events: CursorMap::default(),
            context: RefCell::new(HashMap::new()),
            hooks: RefCell::new(hooks),
        })
    }

    /// A [`Task`] handle for this core. A core is always owned by an
    /// `Rc`, so the self-reference upgrade cannot fail while a method
    /// borrow exists.
    pub(crate) fn handle(&self) -> Task {
        let core = self.me.upgrade().expect("task core is owned by an Rc");
        Task { core }
    }

    pub(crate) fn weak(&self) -> Weak<TaskCore> {
        self.me.clone()
    }

    pub(crate) fn parent_core(&self) -> Option<Rc<TaskCore>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn path(&self) -> String {
        match self.parent_core() {
            Some(parent) if parent.parent.is_some() => {
                format!("{}.{}", parent.path(), self.name.borrow())
            }
            _ => self.name.borrow().clone(),
        }
    }

    pub(crate) fn task_ref(&self) -> TaskRef {
        TaskRef { id: self.id, path: self.path() }
    }

    /// Register `child` under this task, assigning it a sibling-unique
    /// name derived from `base`.
    pub(crate) fn adopt(&self, child: &Rc<TaskCore>, base: &str) {
        let name = unique_child_name(&self.child_names.borrow(), base);
        self.child_names.borrow_mut().insert(name.clone());
        *child.name.borrow_mut() = name;
        self.children.borrow_mut().push(Rc::clone(child));
        self.pending_children.borrow_mut().push(child.id);
    }

    pub(crate) fn change_state(&self, new: TaskState) {
        let old = self.state.get();
        if old == new || old.is_terminal() {
            return;
        }
        debug_assert!(
            TaskState::is_valid_transition(old, new),
            "illegal task transition {old} -> {new}"
        );
        self.state.set(new);
        tracing::debug!(task = %self.path(), from = %old, to = %new, "state change");
        TaskStateChange::new(self.handle(), Some(old), new).emit();
    }

    /// Evaluate the start gate: no pending dependencies and, when
    /// requested, a granted lease.
    pub(crate) fn check_start(&self) {
        if self.state.get() != TaskState::Pending {
            return;
        }
        if !self.pending_dependencies.borrow().is_empty() {
            // Blocked on dependencies; do not sit on a permit meanwhile.
            self.drop_lease();
            return;
        }
        if self.use_lease.get() {
            if self.lease.borrow().is_none() {
                match crate::runloop::lease_client() {
                    Ok(client) => {
                        *self.lease.borrow_mut() = Some(client.request_lease());
                        tracing::trace!(task = %self.path(), "lease requested");
                    }
                    Err(err) => {
                        tracing::warn!(task = %self.path(), error = %err, "cannot request lease");
                        return;
                    }
                }
            }
            let ready = self.lease.borrow().as_ref().is_some_and(|l| l.is_ready());
            if !ready {
                let weak = self.weak();
                if let Some(lease) = self.lease.borrow().as_ref() {
                    lease.notify_ready(Box::new(move || {
                        if let Some(core) = weak.upgrade() {
                            core.check_start();
                        }
                    }));
                }
                return;
            }
        }
        self.started.resolve(GateOutcome::Success);
    }

    /// Evaluate the finish gate: `on_run` returned, every child settled,
    /// every drain handle done.
    pub(crate) fn check_finish(&self) {
        if self.state.get() != TaskState::Waiting {
            return;
        }
        if !self.pending_children.borrow().is_empty() {
            return;
        }
        if !self.drain_background.borrow().is_empty() {
            return;
        }
        self.finish_success();
    }

    fn finish_success(&self) {
        self.finished.resolve(GateOutcome::Success);
        self.change_state(TaskState::Done);
        self.cleanup();
        self.notify_watchers();
    }

    /// Transition to `failed` with `cause` and discard-cancel every live
    /// child.
    pub(crate) fn fail(&self, cause: AbortCause) {
        if self.state.get().is_terminal() {
            return;
        }
        tracing::debug!(task = %self.path(), "task failed");
        self.drop_lease();
        self.started.resolve(GateOutcome::Failed(cause.clone()));
        self.finished.resolve(GateOutcome::Failed(cause));
        self.change_state(TaskState::Failed);
        let children: Vec<Rc<TaskCore>> = self
            .children
            .borrow()
            .iter()
            .filter(|c| !c.state.get().is_terminal())
            .cloned()
            .collect();
        for child in children {
            child.cancel_inner(true);
        }
        self.cleanup();
        self.notify_watchers();
    }

    /// Cancel this task and its live subtree. `discard` selects the
    /// terminal flavour (`discarded` for supervision-driven cancels,
    /// `cancelled` for explicit ones).
    pub(crate) fn cancel_inner(&self, discard: bool) {
        if self.state.get().is_terminal() {
            return;
        }
        tracing::debug!(task = %self.path(), discard, "cancelling task");
        self.cancel_token.cancel();
        self.drop_lease();
        self.started.resolve(GateOutcome::Cancelled);
        self.finished.resolve(GateOutcome::Cancelled);
        self.change_state(if discard { TaskState::Discarded } else { TaskState::Cancelled });
        let children: Vec<Rc<TaskCore>> = self
            .children
            .borrow()
            .iter()
            .filter(|c| !c.state.get().is_terminal())
            .cloned()
            .collect();
        for child in children {
            child.cancel_inner(discard);
        }
        let hook = self.hooks.borrow_mut().on_cancel.take();
        if let Some(hook) = hook {
            let task = self.handle();
            CURRENT_TASK.sync_scope(task.clone(), || hook(task));
        }
        self.cleanup();
        self.notify_watchers();
    }

    /// Deferred discard triggered by `source`'s cancellation.
    fn discard_via(&self, source: &TaskCore) {
        let cancelled_by_observer = source
            .cancelled_by
            .borrow()
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|t| t.id == self.id);
        if cancelled_by_observer {
            // This task explicitly cancelled the source; the cancellation
            // must not bounce back.
            return;
        }
        self.cancel_inner(true);
    }

    /// Post-terminal bookkeeping; runs exactly once.
    pub(crate) fn cleanup(&self) {
        if self.cleaned_up.replace(true) {
            return;
        }
        tracing::trace!(task = %self.path(), "cleanup");
        let hook = self.hooks.borrow_mut().on_cleanup.take();
        if let Some(hook) = hook {
            let task = self.handle();
            CURRENT_TASK.sync_scope(task.clone(), || hook(task));
        }
        self.pending_children.borrow_mut().clear();
        // Withdraw from dependencies we were still watching; a dependency
        // left without watchers is discarded if it opted in.
        let pending: Vec<Rc<TaskCore>> = {
            let ids = self.pending_dependencies.borrow();
            self.dependencies
                .borrow()
                .iter()
                .filter(|dep| ids.contains(&dep.id))
                .cloned()
                .collect()
        };
        self.pending_dependencies.borrow_mut().clear();
        for dep in pending {
            let drained = {
                let mut reverse = dep.reverse_dependencies.borrow_mut();
                reverse.retain(|w| w.upgrade().is_some_and(|t| t.id != self.id));
                reverse.is_empty()
            };
            if drained && dep.discard.get() && !dep.state.get().is_terminal() {
                let dep = Rc::downgrade(&dep);
                tokio::task::spawn_local(async move {
                    if let Some(dep) = dep.upgrade() {
                        dep.cancel_inner(true);
                    }
                });
            }
        }
        for slot in self.background.borrow().iter() {
            slot.token.cancel();
        }
        for slot in self.drain_background.borrow().iter() {
            slot.token.cancel();
        }
        self.drop_lease();
        self.events.close();
    }

    pub(crate) fn drop_lease(&self) {
        let lease = self.lease.borrow_mut().take();
        if let Some(lease) = lease {
            drop(lease);
            tracing::trace!(task = %self.path(), "lease released");
        }
    }

    /// Notify the parent and every reverse-dependency of this task's
    /// terminal state. Parent first (registered at creation), then
    /// reverse-dependencies in registration order.
    fn notify_watchers(&self) {
        if let Some(parent) = self.parent_core() {
            if !parent.cleaned_up.get() {
                parent.child_finished(self);
            }
        }
        let watchers: Vec<Rc<TaskCore>> = self
            .reverse_dependencies
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for watcher in watchers {
            if !watcher.cleaned_up.get() {
                watcher.dependency_finished(self);
            }
        }
    }

    fn child_finished(&self, child: &TaskCore) {
        let was_pending = {
            let mut pending = self.pending_children.borrow_mut();
            let before = pending.len();
            pending.retain(|id| *id != child.id);
            pending.len() != before
        };
        if !was_pending {
            return;
        }
        if !self.state.get().is_terminal() {
            match child.finished.outcome() {
                Some(GateOutcome::Cancelled) => {
                    self.propagate(child, TaskAborted::child_cancelled(child.task_ref()));
                }
                Some(GateOutcome::Failed(cause)) => {
                    self.propagate(child, TaskAborted::child_failed(child.task_ref(), cause));
                }
                _ => {}
            }
        }
        self.check_finish();
    }

    fn dependency_finished(&self, dep: &TaskCore) {
        let was_pending = {
            let mut pending = self.pending_dependencies.borrow_mut();
            let before = pending.len();
            pending.retain(|id| *id != dep.id);
            pending.len() != before
        };
        if !was_pending {
            return;
        }
        self.settle_dependency(dep);
    }

    /// Classify a settled dependency and re-evaluate the start gate.
    pub(crate) fn settle_dependency(&self, dep: &TaskCore) {
        if !self.state.get().is_terminal() {
            match dep.finished.outcome() {
                Some(GateOutcome::Cancelled) => {
                    self.propagate(dep, TaskAborted::dependency_cancelled(dep.task_ref()));
                }
                Some(GateOutcome::Failed(cause)) => {
                    self.propagate(dep, TaskAborted::dependency_failed(dep.task_ref(), cause));
                }
                _ => {}
            }
        }
        self.check_start();
    }

    /// Route an abort from `source` to this task: handlers absorb it,
    /// unhandled cancellations schedule a deferred discard, unhandled
    /// failures fail this task.
    fn propagate(&self, source: &TaskCore, abort: TaskAborted) {
        tracing::trace!(
            task = %self.path(),
            source = %source.path(),
            kind = ?abort.kind(),
            "routing abort"
        );
        let handler = {
            let handlers = self.error_handlers.borrow();
            handlers.get(&Some(source.id)).or_else(|| handlers.get(&None)).cloned()
        };
        if let Some(handler) = handler {
            self.spawn_error_handler(handler, abort);
            return;
        }
        if abort.is_cancellation() {
            let observer = self.weak();
            let source = source.weak();
            tokio::task::spawn_local(async move {
                if let (Some(observer), Some(source)) = (observer.upgrade(), source.upgrade()) {
                    observer.discard_via(&source);
                }
            });
        } else {
            self.fail(AbortCause::Abort(Arc::new(abort)));
        }
    }

    /// Route an error raised by this task's own body. Returns whether a
    /// handler absorbed it.
    pub(crate) fn propagate_self_failure(&self, err: anyhow::Error) -> bool {
        tracing::debug!(task = %self.path(), error = %err, "task body failed");
        let handler = {
            let handlers = self.error_handlers.borrow();
            handlers.get(&Some(self.id)).or_else(|| handlers.get(&None)).cloned()
        };
        let cause = Arc::new(err);
        match handler {
            Some(handler) => {
                let abort =
                    TaskAborted::failed(self.task_ref(), AbortCause::Error(Arc::clone(&cause)));
                self.spawn_error_handler(handler, abort);
                true
            }
            None => {
                self.fail(AbortCause::Error(cause));
                false
            }
        }
    }

    fn spawn_error_handler(&self, handler: Rc<ErrorHandler>, abort: TaskAborted) {
        tracing::debug!(task = %self.path(), kind = ?abort.kind(), "dispatching abort to error handler");
        self.install_background(move || handler(abort), true, true);
    }
}

/// Handle to a task in the tree.
///
/// Handles are cheap to clone and compare by task identity. Dropping the
/// last handle of a finished task releases it; the tree itself keeps
/// children alive through their parent.
#[derive(Clone)]
pub struct Task {
    pub(crate) core: Rc<TaskCore>,
}

impl Task {
    /// Spawn a child of the current task with just an `on_run` body.
    pub fn spawn<F, Fut>(on_run: F) -> Result<Task, LoopError>
    where
        F: FnOnce(Task) -> Fut + 'static,
        Fut: Future<Output = TaskResult> + 'static,
    {
        TaskBuilder::new().on_run(on_run).spawn()
    }

    /// The task's sibling-unique name.
    pub fn name(&self) -> String {
        self.core.name.borrow().clone()
    }

    /// Rename the task, re-uniquifying among its siblings.
    pub fn set_name(&self, name: impl Into<String>) {
        let name = name.into();
        match self.core.parent_core() {
            None => *self.core.name.borrow_mut() = name,
            Some(parent) => {
                let old = self.core.name.borrow().clone();
                parent.child_names.borrow_mut().remove(&old);
                let unique = unique_child_name(&parent.child_names.borrow(), &name);
                parent.child_names.borrow_mut().insert(unique.clone());
                *self.core.name.borrow_mut() = unique;
            }
        }
    }

    /// Dot-joined names from the containing top-level task down to this
    /// one; the root is omitted.
    pub fn path(&self) -> String {
        self.core.path()
    }

    /// A detached identity record for this task.
    pub fn task_ref(&self) -> TaskRef {
        self.core.task_ref()
    }

    /// The parent task, or `None` for the root.
    pub fn parent(&self) -> Option<Task> {
        self.core.parent_core().map(|core| Task { core })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.core.state.get()
    }

    /// Whether the task reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Whether the task finished successfully.
    pub fn is_done(&self) -> bool {
        self.state() == TaskState::Done
    }

    /// Whether the task was cancelled, discarded, or failed.
    pub fn is_aborted(&self) -> bool {
        self.state().is_aborted()
    }

    /// Whether the task auto-cancels once nothing depends on it.
    pub fn discard(&self) -> bool {
        self.core.discard.get()
    }

    /// Control auto-cancellation on losing the last reverse-dependency.
    pub fn set_discard(&self, discard: bool) {
        self.core.discard.set(discard);
    }

    /// Whether the task must hold a lease to run.
    pub fn use_lease(&self) -> bool {
        self.core.use_lease.get()
    }

    /// Enable or disable lease-gated admission. Only legal while the
    /// task is still `preparing`.
    pub fn set_use_lease(&self, use_lease: bool) -> Result<(), LoopError> {
        let state = self.state();
        if state != TaskState::Preparing {
            return Err(LoopError::LeaseFrozen { state });
        }
        self.core.use_lease.set(use_lease);
        Ok(())
    }

    /// Require `dependency` to finish successfully before this task may
    /// start. Legal while this task is `preparing` or `pending`.
    pub fn depends_on(&self, dependency: &Task) -> Result<(), LoopError> {
        let state = self.state();
        if !matches!(state, TaskState::Preparing | TaskState::Pending) {
            return Err(LoopError::DependenciesFrozen { state });
        }
        let core = &self.core;
        let dep = &dependency.core;
        core.dependencies.borrow_mut().push(Rc::clone(dep));
        if dep.state.get().is_terminal() {
            // Already settled: deliver the completion on the next turn.
            let observer = core.weak();
            let dep = dep.weak();
            tokio::task::spawn_local(async move {
                if let (Some(observer), Some(dep)) = (observer.upgrade(), dep.upgrade()) {
                    if !observer.cleaned_up.get() {
                        observer.settle_dependency(&dep);
                    }
                }
            });
        } else {
            core.pending_dependencies.borrow_mut().push(dep.id);
            dep.reverse_dependencies.borrow_mut().push(core.weak());
        }
        Ok(())
    }

    /// Register a handler for aborts propagated from `source` (or from
    /// any source when `None`). A handler stops this task from aborting
    /// when the source fails or is cancelled; it runs as a drain
    /// background handler with the abort as argument.
    pub fn set_error_handler<F, Fut>(&self, source: Option<&Task>, handler: F)
    where
        F: Fn(TaskAborted) -> Fut + 'static,
        Fut: Future<Output = TaskResult> + 'static,
    {
        use futures::FutureExt;
        let key = source.map(|task| task.core.id);
        let handler: Rc<ErrorHandler> = Rc::new(move |abort| handler(abort).boxed_local());
        self.core.error_handlers.borrow_mut().insert(key, handler);
    }

    /// Cancel this task, its live subtree, and (transitively) dependents
    /// that do not handle the cancellation, with the exception of the
    /// current task.
    pub fn cancel(&self) {
        let by = current_task_or_none();
        *self.core.cancelled_by.borrow_mut() = by.map(|task| task.core.weak());
        self.core.cancel_inner(false);
    }

    /// Launch a background future with this task as current task.
    ///
    /// With `wait` the task cannot leave `waiting` until the future
    /// completes; without it the future is cancelled when the task
    /// terminates. Errors are routed through the abort propagator.
    pub fn background<F, Fut>(&self, wait: bool, target: F) -> Result<BackgroundHandle, LoopError>
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = TaskResult> + 'static,
    {
        let state = self.state();
        if !matches!(state, TaskState::Running | TaskState::Waiting) {
            return Err(LoopError::TaskNotRunning { state });
        }
        Ok(self.core.install_background(target, wait, false))
    }

    /// Resolves once the task has started running. Aborts are reported
    /// as [`TaskAborted`] carrying this task.
    pub async fn started(&self) -> Result<(), TaskAborted> {
        let outcome = self.core.started.wait().await;
        self.map_outcome(outcome)
    }

    /// Resolves once the task has finished: success, cancellation, or
    /// failure.
    pub async fn finished(&self) -> Result<(), TaskAborted> {
        let outcome = self.core.finished.wait().await;
        self.map_outcome(outcome)
    }

    /// Non-blocking snapshot of the finished gate.
    pub fn result(&self) -> Option<Result<(), TaskAborted>> {
        self.core.finished.outcome().map(|outcome| self.map_outcome(outcome))
    }

    fn map_outcome(&self, outcome: GateOutcome) -> Result<(), TaskAborted> {
        match outcome {
            GateOutcome::Success => Ok(()),
            GateOutcome::Cancelled => Err(TaskAborted::cancelled(self.task_ref())),
            GateOutcome::Failed(cause) => Err(TaskAborted::failed(self.task_ref(), cause)),
        }
    }

    /// Stream of events of concrete type `E` reaching this task (emitted
    /// by it or any descendant).
    pub fn events<E: TaskEvent>(&self) -> EventStream<E> {
        EventStream::new(self.core.events.subscribe(EventKey::Type(TypeId::of::<E>())))
    }

    /// Stream of every event reaching this task.
    pub fn all_events(&self) -> DynEventStream {
        DynEventStream::new(self.core.events.subscribe(EventKey::Any))
    }

    /// Stream of events declaring category `C` (e.g.
    /// [`crate::event::DebugEvent`]).
    pub fn category_events<C: 'static>(&self) -> DynEventStream {
        DynEventStream::new(self.core.events.subscribe(EventKey::Type(TypeId::of::<C>())))
    }

    /// Run `f` with this task temporarily installed as the current task.
    pub fn as_current<R>(&self, f: impl FnOnce() -> R) -> R {
        CURRENT_TASK.sync_scope(self.clone(), f)
    }

    /// Run a future with this task installed as the current task.
    pub async fn scope<F: Future>(&self, future: F) -> F::Output {
        CURRENT_TASK.scope(self.clone(), future).await
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }
}

impl Eq for Task {}

impl std::hash::Hash for Task {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.core.id.hash(state);
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("path", &self.path())
            .field("state", &self.state())
            .finish()
    }
}

/// Spawn the driver future for `task` on the active loop.
pub(crate) fn spawn_driver(task: Task) {
    let scoped = CURRENT_TASK.scope(task.clone(), drive(task));
    tokio::task::spawn_local(scoped);
}

async fn drive(task: Task) {
    let token = task.core.cancel_token.clone();
    tokio::select! {
        biased;
        _ = token.cancelled() => {
            tracing::trace!(task = %task.core.path(), "driver stopped by cancellation");
        }
        _ = drive_body(task.clone()) => {}
    }
    task.core.cleanup();
}

async fn drive_body(task: Task) {
    if let Err(err) = drive_stages(&task).await {
        let core = &task.core;
        if core.state.get().is_terminal() {
            tracing::trace!(task = %core.path(), error = %err, "late error ignored; task already settled");
            return;
        }
        if core.propagate_self_failure(err) {
            finish_after_absorb(core).await;
        }
    }
}

async fn drive_stages(task: &Task) -> TaskResult {
    let core = &task.core;
    if core.parent.is_some() {
        TaskStateChange::new(task.clone(), None, TaskState::Preparing).emit();
    }
    let prepare = core.hooks.borrow_mut().on_prepare.take();
    if let Some(hook) = prepare {
        hook(task.clone()).await?;
    }
    core.change_state(TaskState::Pending);
    core.check_start();
    if !core.started.wait().await.is_success() {
        // Aborted before starting; the terminal transition already ran.
        return Ok(());
    }
    core.change_state(TaskState::Running);
    let run = core.hooks.borrow_mut().on_run.take();
    if let Some(hook) = run {
        hook(task.clone()).await?;
    }
    if core.state.get().is_terminal() {
        return Ok(());
    }
    core.drop_lease();
    core.change_state(TaskState::Waiting);
    core.check_finish();
    let _ = core.finished.wait().await;
    Ok(())
}

/// After an absorbed body failure, walk the remaining lifecycle edges so
/// the drain handler can gate completion.
async fn finish_after_absorb(core: &Rc<TaskCore>) {
    if core.state.get() == TaskState::Preparing {
        core.change_state(TaskState::Pending);
    }
    if core.state.get() == TaskState::Pending {
        core.started.resolve(GateOutcome::Success);
        core.change_state(TaskState::Running);
    }
    if core.state.get() == TaskState::Running {
        core.drop_lease();
        core.change_state(TaskState::Waiting);
        core.check_finish();
    }
    let _ = core.finished.wait().await;
}

/// Derive a name unique among `existing`, suffixing `#N` on collision.
fn unique_child_name(existing: &HashSet<String>, base: &str) -> String {
    if !existing.contains(base) {
        return base.to_string();
    }
    let mut n = 1u32;
    loop {
        let candidate = format!("{base}#{n}");
        if !existing.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_matrix_accepts_the_happy_path() {
        use TaskState::*;
        let legal = [(Preparing, Pending), (Pending, Running), (Running, Waiting), (Waiting, Done)];
        for (from, to) in legal {
            assert!(
                TaskState::is_valid_transition(from, to),
                "expected {from} -> {to} to be legal"
            );
        }
    }

    #[test]
    fn transition_matrix_rejects_skips_and_reversals() {
        use TaskState::*;
        let illegal = [
            (Preparing, Running),
            (Pending, Waiting),
            (Running, Done),
            (Waiting, Running),
            (Done, Running),
            (Done, Cancelled),
            (Failed, Done),
            (Cancelled, Discarded),
        ];
        for (from, to) in illegal {
            assert!(
                !TaskState::is_valid_transition(from, to),
                "expected {from} -> {to} to be rejected"
            );
        }
    }

    #[test]
    fn every_non_terminal_state_can_abort() {
        use TaskState::*;
        for from in [Preparing, Pending, Running, Waiting] {
            for to in [Cancelled, Discarded, Failed] {
                assert!(TaskState::is_valid_transition(from, to));
            }
        }
    }

    #[test]
    fn state_display_is_lowercase() {
        assert_eq!(TaskState::Preparing.to_string(), "preparing");
        assert_eq!(TaskState::Discarded.to_string(), "discarded");
    }

    #[test]
    fn sibling_names_get_numeric_suffixes() {
        let mut existing = HashSet::new();
        assert_eq!(unique_child_name(&existing, "build"), "build");
        existing.insert("build".to_string());
        assert_eq!(unique_child_name(&existing, "build"), "build#1");
        existing.insert("build#1".to_string());
        assert_eq!(unique_child_name(&existing, "build"), "build#2");
    }
}
