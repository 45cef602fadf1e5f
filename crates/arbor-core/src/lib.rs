//! A structured-concurrency task engine.
//!
//! Work is organised as a tree of [`Task`]s driven by a single-threaded
//! cooperative loop. Tasks declare dependencies on one another, may gate
//! admission on a concurrency [`Lease`], emit events that propagate up
//! the tree, and read scoped [`ContextVar`]s resolved against their
//! ancestors. Failure and cancellation travel along parent/child and
//! dependency edges; per-source error handlers absorb them.
//!
//! [`run_loop`] installs the loop, runs the given body as the root task,
//! and returns once the whole tree has settled:
//!
//! ```
//! use arbor_core::{LoopError, TaskBuilder, run_loop};
//!
//! fn main() -> Result<(), LoopError> {
//!     run_loop(|_root| async move {
//!         let fetch = TaskBuilder::new()
//!             .name("fetch")
//!             .on_run(|_| async { Ok(()) })
//!             .spawn()?;
//!         let parse = TaskBuilder::new()
//!             .name("parse")
//!             .on_run(|_| async { Ok(()) })
//!             .spawn()?;
//!         parse.depends_on(&fetch)?;
//!         Ok(())
//!     })
//! }
//! ```

pub mod context;
pub mod error;
pub mod event;
mod gate;
pub mod lease;
mod runloop;
pub mod task;

pub use context::{ContextVar, TaskVar};
pub use error::{AbortCause, AbortKind, LoopError, TaskAborted, TaskResult};
pub use event::{DebugEvent, DynEventStream, EventStream, TaskEvent, TaskEventExt, TaskStateChange};
pub use lease::{Lease, LeaseClient, LocalLeaseClient};
pub use runloop::{
    LoopOptions, current_task, current_task_or_none, root_task, run_loop, run_loop_with,
};
pub use task::{BackgroundHandle, Task, TaskBuilder, TaskRef, TaskState};
