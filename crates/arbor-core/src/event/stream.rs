//! Subscriber-side event streams.
//!
//! Both stream flavours walk the lazy chain of one-shot futures kept by
//! the subscribed task. A closed chain (the task cleaned up) reads as
//! end-of-stream.

use std::any::Any;
use std::marker::PhantomData;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::{Future, Stream};

use super::{EventRx, TaskEvent};
use crate::error::LoopError;
use crate::runloop::current_task;
use crate::task::BackgroundHandle;

/// Typed stream over events of one concrete type.
///
/// Subscribing by exact type is cheaper than a broad subscription with a
/// post-filter: emissions for other types never touch this chain.
pub struct EventStream<E: TaskEvent> {
    cursor: EventRx,
    filter: Option<Box<dyn Fn(&E) -> bool>>,
    _marker: PhantomData<fn() -> E>,
}

impl<E: TaskEvent> EventStream<E> {
    pub(crate) fn new(cursor: EventRx) -> Self {
        Self { cursor, filter: None, _marker: PhantomData }
    }

    /// Keep only events matching the predicate.
    pub fn filter(mut self, predicate: impl Fn(&E) -> bool + 'static) -> Self {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Next matching event, or `None` once the subscribed task has
    /// cleaned up.
    pub async fn next(&mut self) -> Option<Rc<E>> {
        futures::StreamExt::next(self).await
    }

    /// Consume the stream on a fire-and-forget background handle of the
    /// current task, invoking `handler` for each event.
    pub fn handle<F>(self, mut handler: F) -> Result<BackgroundHandle, LoopError>
    where
        F: FnMut(Rc<E>) + 'static,
    {
        let task = current_task()?;
        let mut stream = self;
        task.background(false, move || async move {
            while let Some(event) = stream.next().await {
                handler(event);
            }
            Ok(())
        })
    }
}

impl<E: TaskEvent> Stream for EventStream<E> {
    type Item = Rc<E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            let link = match Pin::new(&mut this.cursor).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(_)) => return Poll::Ready(None),
                Poll::Ready(Ok(link)) => link,
            };
            this.cursor = link.next;
            let any: Rc<dyn Any> = link.event;
            if let Ok(event) = any.downcast::<E>() {
                if this.filter.as_ref().map_or(true, |f| f(&event)) {
                    return Poll::Ready(Some(event));
                }
            }
        }
    }
}

/// Dynamically-typed stream over a category or over all events.
pub struct DynEventStream {
    cursor: EventRx,
    filter: Option<Box<dyn Fn(&dyn TaskEvent) -> bool>>,
}

impl DynEventStream {
    pub(crate) fn new(cursor: EventRx) -> Self {
        Self { cursor, filter: None }
    }

    /// Keep only events matching the predicate.
    pub fn filter(mut self, predicate: impl Fn(&dyn TaskEvent) -> bool + 'static) -> Self {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Next matching event, or `None` once the subscribed task has
    /// cleaned up.
    pub async fn next(&mut self) -> Option<Rc<dyn TaskEvent>> {
        futures::StreamExt::next(self).await
    }

    /// Consume the stream on a fire-and-forget background handle of the
    /// current task, invoking `handler` for each event.
    pub fn handle<F>(self, mut handler: F) -> Result<BackgroundHandle, LoopError>
    where
        F: FnMut(Rc<dyn TaskEvent>) + 'static,
    {
        let task = current_task()?;
        let mut stream = self;
        task.background(false, move || async move {
            while let Some(event) = stream.next().await {
                handler(event);
            }
            Ok(())
        })
    }
}

impl Stream for DynEventStream {
    type Item = Rc<dyn TaskEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            let link = match Pin::new(&mut this.cursor).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(_)) => return Poll::Ready(None),
                Poll::Ready(Ok(link)) => link,
            };
            this.cursor = link.next;
            if this.filter.as_ref().map_or(true, |f| f(link.event.as_ref())) {
                return Poll::Ready(Some(link.event));
            }
        }
    }
}
