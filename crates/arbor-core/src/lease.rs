//! Lease-gated admission: the injectable permit source and the default
//! in-process pool.
//!
//! A task with `use_lease` set requests a lease before it may enter
//! `running`. The client hands out leases immediately; readiness arrives
//! later through the lease itself. Dropping a lease releases it.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

/// A concurrency permit.
///
/// Dropping the lease releases it back to its client.
pub trait Lease {
    /// Whether the permit has been granted.
    fn is_ready(&self) -> bool;

    /// Register a callback invoked once the permit is granted. Invoked
    /// immediately if the lease is already ready.
    fn notify_ready(&self, callback: Box<dyn FnOnce()>);
}

/// Source of leases.
///
/// Implementations may grant immediately or queue the request; either
/// way the returned lease signals readiness through [`Lease`].
pub trait LeaseClient {
    fn request_lease(&self) -> Box<dyn Lease>;
}

/// In-process lease pool with a fixed number of slots.
///
/// Leases are granted in request order; a released slot is handed to the
/// oldest surviving waiter.
#[derive(Clone)]
pub struct LocalLeaseClient {
    pool: Rc<PoolState>,
}

struct PoolState {
    capacity: usize,
    in_use: Cell<usize>,
    waiters: RefCell<VecDeque<Weak<SlotState>>>,
}

#[derive(Default)]
struct SlotState {
    ready: Cell<bool>,
    callbacks: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl LocalLeaseClient {
    /// Pool sized to the host's available parallelism.
    pub fn new() -> Self {
        let capacity = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self::with_capacity(capacity)
    }

    /// Pool with an explicit slot count (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pool: Rc::new(PoolState {
                capacity: capacity.max(1),
                in_use: Cell::new(0),
                waiters: RefCell::new(VecDeque::new()),
            }),
        }
    }

    /// Number of currently granted leases.
    pub fn in_use(&self) -> usize {
        self.pool.in_use.get()
    }

    /// Number of requests still waiting for a slot.
    pub fn waiting(&self) -> usize {
        self.pool.waiters.borrow().iter().filter(|w| w.upgrade().is_some()).count()
    }
}

impl Default for LocalLeaseClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseClient for LocalLeaseClient {
    fn request_lease(&self) -> Box<dyn Lease> {
        let slot = Rc::new(SlotState::default());
        if self.pool.in_use.get() < self.pool.capacity {
            self.pool.in_use.set(self.pool.in_use.get() + 1);
            slot.ready.set(true);
            tracing::trace!(in_use = self.pool.in_use.get(), "lease granted");
        } else {
            self.pool.waiters.borrow_mut().push_back(Rc::downgrade(&slot));
            tracing::trace!(waiting = self.waiting(), "lease queued");
        }
        Box::new(PoolLease { pool: Rc::clone(&self.pool), slot })
    }
}

impl PoolState {
    /// Return a slot and hand it to the oldest surviving waiter.
    fn release_slot(&self) {
        self.in_use.set(self.in_use.get() - 1);
        loop {
            let next = self.waiters.borrow_mut().pop_front();
            let Some(weak) = next else { break };
            let Some(slot) = weak.upgrade() else { continue };
            self.in_use.set(self.in_use.get() + 1);
            slot.ready.set(true);
            let callbacks: Vec<_> = slot.callbacks.borrow_mut().drain(..).collect();
            for callback in callbacks {
                callback();
            }
            break;
        }
        tracing::trace!(in_use = self.in_use.get(), "lease released");
    }
}

struct PoolLease {
    pool: Rc<PoolState>,
    slot: Rc<SlotState>,
}

impl Lease for PoolLease {
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

impl Drop for PoolLease {
    fn drop(&mut self) {
        if self.slot.ready.get() {
            self.pool.release_slot();
        } else {
            // Dropped while still queued: forget the reservation.
            let target = Rc::downgrade(&self.slot);
            self.pool.waiters.borrow_mut().retain(|w| !w.ptr_eq(&target));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn grants_up_to_capacity() {
        let client = LocalLeaseClient::with_capacity(2);
        let first = client.request_lease();
        let second = client.request_lease();
        let third = client.request_lease();

        assert!(first.is_ready());
        assert!(second.is_ready());
        assert!(!third.is_ready(), "third lease must queue behind capacity 2");
        assert_eq!(client.in_use(), 2);
        assert_eq!(client.waiting(), 1);
    }

    #[test]
    fn released_slot_goes_to_oldest_waiter() {
        let client = LocalLeaseClient::with_capacity(1);
        let first = client.request_lease();
        let second = client.request_lease();
        let third = client.request_lease();

        let fired = Rc::new(Cell::new(false));
        let flag = Rc::clone(&fired);
        second.notify_ready(Box::new(move || flag.set(true)));

        drop(first);
        assert!(second.is_ready(), "oldest waiter gets the released slot");
        assert!(fired.get(), "ready callback must fire on handoff");
        assert!(!third.is_ready());
        assert_eq!(client.in_use(), 1);
    }

    #[test]
    fn dropping_a_queued_lease_forgets_the_reservation() {
        let client = LocalLeaseClient::with_capacity(1);
        let first = client.request_lease();
        let second = client.request_lease();
        let third = client.request_lease();

        drop(second);
        assert_eq!(client.waiting(), 1);

        drop(first);
        assert!(third.is_ready(), "slot skips the dropped reservation");
    }

    #[test]
    fn notify_ready_on_a_granted_lease_fires_immediately() {
        let client = LocalLeaseClient::with_capacity(1);
        let lease = client.request_lease();
        let fired = Rc::new(Cell::new(false));
        let flag = Rc::clone(&fired);
        lease.notify_ready(Box::new(move || flag.set(true)));
        assert!(fired.get());
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let client = LocalLeaseClient::with_capacity(0);
        let lease = client.request_lease();
        assert!(lease.is_ready());
    }
}
