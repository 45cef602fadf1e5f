//! Hierarchical event delivery.
//!
//! An event captures its source task when it is constructed. Emitting it
//! walks from the source through its ancestors and feeds every matching
//! cursor. Each cursor is a one-shot future resolving to the event plus
//! the next cursor, forming a lazy linked list that any number of
//! subscribers can replay at their own pace.

mod stream;

pub use stream::{DynEventStream, EventStream};

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::Shared;

use crate::task::{Task, TaskState};

/// An event emitted by a task.
///
/// Implementations capture the emitting task at construction time,
/// usually via [`crate::current_task`]; to emit on behalf of another
/// task, construct the event inside [`Task::as_current`]. `categories`
/// lists marker types the event should match beyond its concrete type;
/// every event additionally matches [`Task::all_events`].
pub trait TaskEvent: Any + fmt::Debug {
    /// The task that created this event.
    fn source(&self) -> &Task;

    /// Category marker types this event belongs to.
    fn categories(&self) -> Vec<TypeId> {
        Vec::new()
    }
}

/// Emission, available on every event type.
pub trait TaskEventExt: TaskEvent + Sized {
    /// Deliver this event to subscribers on the source task and its
    /// ancestors, in emission order per subscriber.
    fn emit(self) {
        deliver(Rc::new(self));
    }
}

impl<E: TaskEvent + Sized> TaskEventExt for E {}

pub(crate) fn deliver(event: Rc<dyn TaskEvent>) {
    let mut keys = vec![EventKey::Type((*event).type_id())];
    keys.extend(event.categories().into_iter().map(EventKey::Type));
    keys.push(EventKey::Any);

    tracing::trace!(source = %event.source().path(), event = ?event, "emit");

    let mut cursor = Some(Rc::clone(&event.source().core));
    while let Some(task) = cursor {
        task.events.push(&keys, &event);
        cursor = task.parent_core();
    }
}

/// Subscription key: a concrete event type, a category marker, or every
/// event.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) enum EventKey {
    Any,
    Type(TypeId),
}

pub(crate) type EventRx = Shared<oneshot::Receiver<EventLink>>;

/// One resolved element of an event chain.
#[derive(Clone)]
pub(crate) struct EventLink {
    pub(crate) event: Rc<dyn TaskEvent>,
    pub(crate) next: EventRx,
}

struct CursorSlot {
    tx: oneshot::Sender<EventLink>,
    rx: EventRx,
}

/// Per-task cursor table: the live tail of each subscribed chain.
#[derive(Default)]
pub(crate) struct CursorMap {
    slots: RefCell<HashMap<EventKey, CursorSlot>>,
}

impl CursorMap {
    /// Current tail for `key`, creating the chain on first subscription.
    pub(crate) fn subscribe(&self, key: EventKey) -> EventRx {
        let mut slots = self.slots.borrow_mut();
        let slot = slots.entry(key).or_insert_with(|| {
            let (tx, rx) = oneshot::channel();
            CursorSlot { tx, rx: rx.shared() }
        });
        slot.rx.clone()
    }

    /// Resolve the cursors matching `keys` with `event` and install the
    /// next links. Keys nobody subscribed to cost nothing.
    fn push(&self, keys: &[EventKey], event: &Rc<dyn TaskEvent>) {
        let mut slots = self.slots.borrow_mut();
        for key in keys {
            let Some(slot) = slots.remove(key) else { continue };
            let (tx, rx) = oneshot::channel();
            let rx = rx.shared();
            let _ = slot.tx.send(EventLink { event: Rc::clone(event), next: rx.clone() });
            slots.insert(*key, CursorSlot { tx, rx });
        }
    }

    /// Drop all cursors, signalling end-of-stream to subscribers.
    pub(crate) fn close(&self) {
        self.slots.borrow_mut().clear();
    }
}

/// Category for events emitted by the engine itself.
#[derive(Debug)]
pub struct DebugEvent;

/// Emitted whenever a task changes state.
#[derive(Debug)]
pub struct TaskStateChange {
    source: Task,
    /// State before the transition; `None` for the initial transition.
    pub previous: Option<TaskState>,
    /// State after the transition.
    pub state: TaskState,
}

impl TaskStateChange {
    pub(crate) fn new(source: Task, previous: Option<TaskState>, state: TaskState) -> Self {
        Self { source, previous, state }
    }
}

impl TaskEvent for TaskStateChange {
    fn source(&self) -> &Task {
        &self.source
    }

    fn categories(&self) -> Vec<TypeId> {
        vec![TypeId::of::<DebugEvent>()]
    }
}
