//! Hierarchical context variables.
//!
//! A context variable resolves against the current task: reads walk up
//! the task tree to the nearest override and fall back to the variable's
//! default; writes target the current task, or the default when no task
//! loop is running. Overrides are stored inside the task they belong to,
//! so they never outlive it.
//!
//! Group related variables in a plain struct to form a context group:
//!
//! ```
//! use arbor_core::ContextVar;
//!
//! struct BuildContext {
//!     jobs: ContextVar<usize>,
//!     target: ContextVar<String>,
//! }
//!
//! let ctx = BuildContext {
//!     jobs: ContextVar::with_default("jobs", 1),
//!     target: ContextVar::new("target"),
//! };
//! assert_eq!(ctx.jobs.get().unwrap(), 1);
//! assert!(ctx.target.get().is_err());
//! ```

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::LoopError;
use crate::runloop::current_task_or_none;
use crate::task::Task;

static NEXT_VAR_ID: AtomicU64 = AtomicU64::new(0);

/// A typed, task-scoped variable.
pub struct ContextVar<T: Clone + 'static> {
    id: u64,
    name: &'static str,
    default: RefCell<Option<T>>,
    _marker: PhantomData<T>,
}

impl<T: Clone + 'static> ContextVar<T> {
    /// A variable without a default; reads fail until a value is set
    /// somewhere up the chain.
    pub fn new(name: &'static str) -> Self {
        Self {
            id: NEXT_VAR_ID.fetch_add(1, Ordering::Relaxed),
            name,
            default: RefCell::new(None),
            _marker: PhantomData,
        }
    }

    /// A variable with a default value.
    pub fn with_default(name: &'static str, default: T) -> Self {
        let var = Self::new(name);
        *var.default.borrow_mut() = Some(default);
        var
    }

    /// The variable's name, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Resolve the variable for the current task: nearest ancestor
    /// override (inclusive), else the default.
    pub fn get(&self) -> Result<T, LoopError> {
        self.resolve(current_task_or_none())
    }

    /// Set the variable on the current task, or the default when no task
    /// loop is running.
    pub fn set(&self, value: T) {
        match current_task_or_none() {
            Some(task) => self.store(&task, value),
            None => *self.default.borrow_mut() = Some(value),
        }
    }

    /// Remove the current task's override, or the default when no task
    /// loop is running. Fails if nothing was set at that level.
    pub fn unset(&self) -> Result<(), LoopError> {
        match current_task_or_none() {
            Some(task) => self.remove(&task),
            None => self
                .default
                .borrow_mut()
                .take()
                .map(|_| ())
                .ok_or(LoopError::ContextVarNotSet { name: self.name }),
        }
    }

    /// The default value, if any.
    pub fn default(&self) -> Option<T> {
        self.default.borrow().clone()
    }

    /// Replace the default value.
    pub fn set_default(&self, value: T) {
        *self.default.borrow_mut() = Some(value);
    }

    /// View this variable as if `task` were the current task.
    pub fn bind<'a>(&'a self, task: &Task) -> TaskVar<'a, T> {
        TaskVar { var: self, task: task.clone() }
    }

    fn resolve(&self, start: Option<Task>) -> Result<T, LoopError> {
        let mut cursor = start;
        while let Some(task) = cursor {
            if let Some(value) = self.lookup(&task) {
                return Ok(value);
            }
            cursor = task.parent();
        }
        self.default
            .borrow()
            .clone()
            .ok_or(LoopError::ContextVarNotSet { name: self.name })
    }

    fn lookup(&self, task: &Task) -> Option<T> {
        task.core
            .context
            .borrow()
            .get(&self.id)
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    fn store(&self, task: &Task, value: T) {
        task.core.context.borrow_mut().insert(self.id, Box::new(value));
    }

    fn remove(&self, task: &Task) -> Result<(), LoopError> {
        task.core
            .context
            .borrow_mut()
            .remove(&self.id)
            .map(|_| ())
            .ok_or(LoopError::ContextVarNotSet { name: self.name })
    }
}

/// A context variable viewed through a fixed task.
///
/// Reads, writes, and deletes behave as if that task were the current
/// task when the backing variable is accessed.
pub struct TaskVar<'a, T: Clone + 'static> {
    var: &'a ContextVar<T>,
    task: Task,
}

impl<T: Clone + 'static> TaskVar<'_, T> {
    pub fn get(&self) -> Result<T, LoopError> {
        self.var.resolve(Some(self.task.clone()))
    }

    pub fn set(&self, value: T) {
        self.var.store(&self.task, value);
    }

    pub fn unset(&self) -> Result<(), LoopError> {
        self.var.remove(&self.task)
    }
}
