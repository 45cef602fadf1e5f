//! Shared test utilities for arbor integration tests.
//!
//! The task loop is a process-wide singleton, so tests within one binary
//! are serialised through a mutex before installing a loop. A manual
//! lease client and a state-transition recorder cover the lease and
//! event scenarios.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::rc::Rc;
use std::sync::Mutex;

use arbor_core::{
    EventStream, Lease, LeaseClient, LoopError, LoopOptions, Task, TaskEvent, TaskResult,
    TaskState, TaskStateChange, run_loop_with,
};

/// Serialises loop installation across parallel tests in one binary.
static LOOP_MUTEX: Mutex<()> = Mutex::new(());

/// Initialise test logging once; respects `RUST_LOG`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Run a task loop for a test body, without interrupt handling.
pub fn run_test_loop<F, Fut>(on_run: F) -> Result<(), LoopError>
where
    F: FnOnce(Task) -> Fut + 'static,
    Fut: Future<Output = TaskResult> + 'static,
{
    run_test_loop_with(None, on_run)
}

/// Like [`run_test_loop`], with an injected lease client.
pub fn run_test_loop_with<F, Fut>(
    lease_client: Option<Rc<dyn LeaseClient>>,
    on_run: F,
) -> Result<(), LoopError>
where
    F: FnOnce(Task) -> Fut + 'static,
    Fut: Future<Output = TaskResult> + 'static,
{
    let _serial = LOOP_MUTEX.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    init_logging();
    run_loop_with(
        LoopOptions { handle_interrupt: false, lease_client },
        on_run,
    )
}

/// Yield to the loop `rounds` times so queued drivers and deferred
/// callbacks get to run.
pub async fn settle(rounds: usize) {
    for _ in 0..rounds {
        tokio::task::yield_now().await;
    }
}

/// One observed state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRecord {
    pub path: String,
    pub previous: Option<TaskState>,
    pub state: TaskState,
}

/// Records every [`TaskStateChange`] reaching a task, for post-run
/// assertions.
///
/// Subscribe before the interesting tasks are spawned, run the loop,
/// then drain with [`StateRecorder::collect`]; the event chain is fully
/// resolved by then, so collection does not block.
pub struct StateRecorder {
    stream: RefCell<Option<EventStream<TaskStateChange>>>,
}

impl StateRecorder {
    /// Subscribe to all state changes reaching `task` (usually the
    /// root).
    pub fn subscribe(task: &Task) -> Self {
        Self {
            stream: RefCell::new(Some(task.events::<TaskStateChange>())),
        }
    }

    /// Drain everything observed. Call after the loop has exited.
    pub fn collect(&self) -> Vec<TransitionRecord> {
        let Some(mut stream) = self.stream.borrow_mut().take() else {
            return Vec::new();
        };
        let mut log = Vec::new();
        futures::executor::block_on(async {
            while let Some(event) = stream.next().await {
                log.push(TransitionRecord {
                    path: event.source().path(),
                    previous: event.previous,
                    state: event.state,
                });
            }
        });
        log
    }
}

/// Lease client whose grants are driven explicitly by the test.
#[derive(Clone, Default)]
pub struct ManualLeaseClient {
    state: Rc<ManualState>,
}

#[derive(Default)]
struct ManualState {
    pending: RefCell<VecDeque<Rc<ManualSlot>>>,
    granted: Cell<usize>,
    released: Cell<usize>,
    on_release: RefCell<Option<Rc<dyn Fn()>>>,
}

#[derive(Default)]
struct ManualSlot {
    ready: Cell<bool>,
    callbacks: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl ManualLeaseClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leases granted so far.
    pub fn granted(&self) -> usize {
        self.state.granted.get()
    }

    /// Number of granted leases released so far.
    pub fn released(&self) -> usize {
        self.state.released.get()
    }

    /// Number of requests not yet granted.
    pub fn pending(&self) -> usize {
        self.state.pending.borrow().len()
    }

    /// Invoke `hook` whenever a granted lease is released.
    pub fn on_release(&self, hook: impl Fn() + 'static) {
        *self.state.on_release.borrow_mut() = Some(Rc::new(hook));
    }

    /// Grant the oldest pending lease. Returns whether one was pending.
    pub fn grant_next(&self) -> bool {
        let slot = self.state.pending.borrow_mut().pop_front();
        match slot {
            Some(slot) => {
                slot.ready.set(true);
                self.state.granted.set(self.state.granted.get() + 1);
                let callbacks: Vec<_> = slot.callbacks.borrow_mut().drain(..).collect();
                for callback in callbacks {
                    callback();
                }
                true
            }
            None => false,
        }
    }
}

impl LeaseClient for ManualLeaseClient {
    fn request_lease(&self) -> Box<dyn Lease> {
        let slot = Rc::new(ManualSlot::default());
        self.state.pending.borrow_mut().push_back(Rc::clone(&slot));
        Box::new(ManualLease { state: Rc::clone(&self.state), slot })
    }
}

struct ManualLease {
    state: Rc<ManualState>,
    slot: Rc<ManualSlot>,
}

impl Lease for ManualLease {
    fn is_ready(&self) -> bool {
        self.slot.ready.get()
    }

    fn notify_ready(&self, callback: Box<dyn FnOnce()>) {
        if self.slot.ready.get() {
            callback();
        } else {
            self.slot.callbacks.borrow_mut().push(callback);
        }
    }
}

impl Drop for ManualLease {
    fn drop(&mut self) {
        if self.slot.ready.get() {
            self.state.released.set(self.state.released.get() + 1);
            let hook = self.state.on_release.borrow().clone();
            if let Some(hook) = hook {
                hook();
            }
        } else {
            let mut pending = self.state.pending.borrow_mut();
            pending.retain(|slot| !Rc::ptr_eq(slot, &self.slot));
        }
    }
}
