//! Background futures owned by a task.
//!
//! Two classes: drain handles (`wait = true`) gate the owning task's
//! `waiting -> done` transition and carry error handlers; fire-and-forget
//! handles are cancelled when the task terminates.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::TaskCore;
use crate::error::{AbortCause, TaskResult};
use crate::runloop::CURRENT_TASK;

pub(crate) struct BackgroundSlot {
    pub(crate) id: u64,
    pub(crate) token: CancellationToken,
}

/// Handle to a background future launched with
/// [`Task::background`](super::Task::background).
#[derive(Clone)]
pub struct BackgroundHandle {
    token: CancellationToken,
}

impl BackgroundHandle {
    /// Request cancellation of the background future. The cancellation
    /// is swallowed; it never aborts the owning task.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl TaskCore {
    pub(crate) fn install_background<F, Fut>(
        &self,
        target: F,
        wait: bool,
        error_handler: bool,
    ) -> BackgroundHandle
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = TaskResult> + 'static,
    {
        let token = CancellationToken::new();
        let handle = BackgroundHandle { token: token.clone() };
        // An error handler installed on a finished task still runs, but
        // unsupervised: nothing is left to gate or to clean it up.
        let supervised = !(error_handler && self.state.get().is_terminal());
        let wait = wait && supervised;
        let id = self.next_background_id.get();
        self.next_background_id.set(id + 1);
        if supervised {
            let slot = BackgroundSlot { id, token: token.clone() };
            if wait {
                self.drain_background.borrow_mut().push(slot);
            } else {
                self.background.borrow_mut().push(slot);
            }
        }
        let owner = self.handle();
        let scoped = CURRENT_TASK.scope(owner.clone(), async move {
            let core = &owner.core;
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                result = target() => Some(result),
            };
            if supervised {
                let list = if wait { &core.drain_background } else { &core.background };
                list.borrow_mut().retain(|slot| slot.id != id);
            }
            if let Some(Err(err)) = result {
                if !core.state.get().is_terminal() {
                    if error_handler {
                        // A failing error handler must not re-enter the
                        // handler lookup; the task fails outright.
                        core.fail(AbortCause::Error(Arc::new(err)));
                    } else {
                        core.propagate_self_failure(err);
                    }
                }
            }
            if supervised && wait {
                core.check_finish();
            }
        });
        tokio::task::spawn_local(scoped);
        handle
    }
}
