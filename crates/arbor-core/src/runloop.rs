//! The process-wide task loop: singleton installation, the root task,
//! and current-task accessors.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use tokio::task::LocalSet;

use crate::error::{LoopError, TaskResult};
use crate::lease::{LeaseClient, LocalLeaseClient};
use crate::task::{Hooks, Task, TaskCore, spawn_driver};

tokio::task_local! {
    /// The task in whose scope the running code executes.
    pub(crate) static CURRENT_TASK: Task;
}

/// Only one loop may exist per process at a time.
static LOOP_INSTALLED: AtomicBool = AtomicBool::new(false);

thread_local! {
    static ACTIVE_LOOP: RefCell<Option<Rc<LoopShared>>> = const { RefCell::new(None) };
}

struct LoopShared {
    root: RefCell<Option<Task>>,
    lease_client: Rc<dyn LeaseClient>,
}

/// Options for [`run_loop_with`].
pub struct LoopOptions {
    /// Cancel the root task on Ctrl-C.
    pub handle_interrupt: bool,
    /// Lease source for `use_lease` tasks. Defaults to a
    /// [`LocalLeaseClient`] sized to the host parallelism.
    pub lease_client: Option<Rc<dyn LeaseClient>>,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self { handle_interrupt: true, lease_client: None }
    }
}

/// Run a task loop with default options: install the loop singleton, run
/// `on_run` as the root task, and block until the root finishes.
pub fn run_loop<F, Fut>(on_run: F) -> Result<(), LoopError>
where
    F: FnOnce(Task) -> Fut + 'static,
    Fut: Future<Output = TaskResult> + 'static,
{
    run_loop_with(LoopOptions::default(), on_run)
}

/// Run a task loop.
///
/// Fails with [`LoopError::AlreadyInstalled`] when a loop exists. The
/// singleton is cleared on exit regardless of the outcome; a root abort
/// is reported as [`LoopError::RootAborted`].
pub fn run_loop_with<F, Fut>(options: LoopOptions, on_run: F) -> Result<(), LoopError>
where
    F: FnOnce(Task) -> Fut + 'static,
    Fut: Future<Output = TaskResult> + 'static,
{
    if LOOP_INSTALLED.swap(true, Ordering::SeqCst) {
        return Err(LoopError::AlreadyInstalled);
    }
    let _guard = InstallGuard;

    let lease_client = options
        .lease_client
        .unwrap_or_else(|| Rc::new(LocalLeaseClient::new()));
    let shared = Rc::new(LoopShared { root: RefCell::new(None), lease_client });
    ACTIVE_LOOP.with_borrow_mut(|slot| *slot = Some(Rc::clone(&shared)));
    tracing::debug!("task loop installed");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = LocalSet::new();

    let root = local.block_on(&runtime, async move {
        let hooks = Hooks {
            on_run: Some(Box::new(move |task| on_run(task).boxed_local())),
            ..Hooks::default()
        };
        let core = TaskCore::new(None, hooks, false, true);
        *core.name.borrow_mut() = "root".to_string();
        let root = core.handle();
        *shared.root.borrow_mut() = Some(root.clone());

        if options.handle_interrupt {
            let target = Rc::downgrade(&root.core);
            tokio::task::spawn_local(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        if let Some(core) = target.upgrade() {
                            tracing::info!("interrupt received, cancelling root task");
                            core.cancel_inner(false);
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to install interrupt handler");
                    }
                }
            });
        }

        spawn_driver(root.clone());
        let _ = root.core.finished.wait().await;
        root
    });

    tracing::debug!(state = %root.state(), "task loop finished");
    match root.result() {
        Some(Err(abort)) => Err(LoopError::RootAborted(abort)),
        _ => Ok(()),
    }
}

/// Clears the singleton, also on panic paths.
struct InstallGuard;

impl Drop for InstallGuard {
    fn drop(&mut self) {
        ACTIVE_LOOP.with_borrow_mut(|slot| *slot = None);
        LOOP_INSTALLED.store(false, Ordering::SeqCst);
        tracing::debug!("task loop uninstalled");
    }
}

/// The task in whose scope the calling code is executing.
pub fn current_task() -> Result<Task, LoopError> {
    CURRENT_TASK.try_with(|task| task.clone()).map_err(|_| LoopError::NoCurrentTask)
}

/// Like [`current_task`], but `None` instead of an error.
pub fn current_task_or_none() -> Option<Task> {
    CURRENT_TASK.try_with(|task| task.clone()).ok()
}

/// The root task of the active loop.
pub fn root_task() -> Result<Task, LoopError> {
    ACTIVE_LOOP.with_borrow(|slot| {
        slot.as_ref()
            .and_then(|l| l.root.borrow().clone())
            .ok_or(LoopError::NotInstalled)
    })
}

/// The lease client of the active loop.
pub(crate) fn lease_client() -> Result<Rc<dyn LeaseClient>, LoopError> {
    ACTIVE_LOOP.with_borrow(|slot| {
        slot.as_ref()
            .map(|l| Rc::clone(&l.lease_client))
            .ok_or(LoopError::NotInstalled)
    })
}
