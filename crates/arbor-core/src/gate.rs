//! One-shot completion gates shared by the task driver and observers.

use std::cell::RefCell;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::Shared;

use crate::error::AbortCause;

/// How a gate resolved.
#[derive(Clone, Debug)]
pub(crate) enum GateOutcome {
    Success,
    Cancelled,
    Failed(AbortCause),
}

impl GateOutcome {
    pub(crate) fn is_success(&self) -> bool {
        matches!(self, GateOutcome::Success)
    }
}

/// A one-shot signal that resolves exactly once and can be awaited by any
/// number of observers. The outcome is also inspectable synchronously.
pub(crate) struct Gate {
    outcome: RefCell<Option<GateOutcome>>,
    tx: RefCell<Option<oneshot::Sender<GateOutcome>>>,
    rx: Shared<oneshot::Receiver<GateOutcome>>,
}

impl Gate {
    pub(crate) fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            outcome: RefCell::new(None),
            tx: RefCell::new(Some(tx)),
            rx: rx.shared(),
        }
    }

    /// Resolve the gate. Later calls are ignored; returns whether this
    /// call was the resolving one.
    pub(crate) fn resolve(&self, outcome: GateOutcome) -> bool {
        let Some(tx) = self.tx.borrow_mut().take() else {
            return false;
        };
        *self.outcome.borrow_mut() = Some(outcome.clone());
        let _ = tx.send(outcome);
        true
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    pub(crate) fn outcome(&self) -> Option<GateOutcome> {
        self.outcome.borrow().clone()
    }

    pub(crate) async fn wait(&self) -> GateOutcome {
        let cached = self.outcome();
        if let Some(outcome) = cached {
            return outcome;
        }
        match self.rx.clone().await {
            Ok(outcome) => outcome,
            // The sender only disappears without resolving when a task is
            // torn down mid-flight; observers see that as a cancellation.
            Err(_) => GateOutcome::Cancelled,
        }
    }
}
