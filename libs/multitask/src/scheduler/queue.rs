// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The intrusive multi-producer, single-consumer ready queue.
//!
//! This is Dmitry Vyukov's [intrusive MPSC node-based queue] with one
//! addition: the low bit of the tail pointer records that the consumer has
//! run out of work and is about to sleep. Producers swap themselves into
//! the tail, so the first producer after the consumer parked sees the bit
//! in the old tail and knows it has to wake the consumer. Every other
//! producer sees an untagged pointer and does nothing extra.
//!
//! [intrusive MPSC node-based queue]: https://www.1024cores.net/home/lock-free-algorithms/queues/intrusive-mpsc-node-based-queue

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicPtr, Ordering};
use core::fmt;
use core::ptr::{self, NonNull};

/// Set in the tail pointer while the consumer is parked.
const PARKED: usize = 0b1;

/// The intrusive link every queued node starts with.
///
/// A node's link belongs to at most one list at a time: either this queue or
/// the private wait list of some synchronization primitive.
#[derive(Debug)]
#[repr(C)]
pub(crate) struct Header {
    pub(crate) next: AtomicPtr<Header>,
}

impl Header {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TryDequeueError {
    /// Nothing is queued.
    Empty,
    /// A producer is halfway through an enqueue. Retrying shortly succeeds.
    Inconsistent,
}

pub(crate) struct ReadyQueue {
    tail: AtomicPtr<Header>,
    /// Consumer end. Only touched by the owning thread.
    head: UnsafeCell<NonNull<Header>>,
    stub: NonNull<Header>,
}

// Safety: producers only touch `tail` and the `next` links through atomics,
// `head` is confined to the consumer.
unsafe impl Send for ReadyQueue {}
// Safety: see above
unsafe impl Sync for ReadyQueue {}

// === impl ReadyQueue ===

impl ReadyQueue {
    pub(crate) fn new() -> Self {
        let stub = NonNull::from(Box::leak(Box::new(Header::new())));

        Self {
            tail: AtomicPtr::new(stub.as_ptr()),
            head: UnsafeCell::new(stub),
            stub,
        }
    }

    /// Appends `node` to the queue.
    ///
    /// Returns `true` if the consumer was parked, in which case the caller is
    /// responsible for waking it up.
    pub(crate) fn enqueue(&self, node: NonNull<Header>) -> bool {
        // Safety: the caller hands us exclusive use of the node's link
        unsafe { node.as_ref().next.store(ptr::null_mut(), Ordering::Relaxed) };

        let prev = self.tail.swap(node.as_ptr(), Ordering::AcqRel);
        let parked = prev.addr() & PARKED != 0;
        let prev = prev.map_addr(|addr| addr & !PARKED);

        // Safety: the consumer can't move past `prev` until this store
        // happened, so it is still alive.
        unsafe { (*prev).next.store(node.as_ptr(), Ordering::Release) };

        parked
    }

    /// Removes the node at the front of the queue.
    ///
    /// # Safety
    ///
    /// Must only be called by the single consumer.
    pub(crate) unsafe fn try_dequeue(&self) -> Result<NonNull<Header>, TryDequeueError> {
        self.head.with_mut(|head| {
            // Safety: ensured by caller, we are the only one touching `head`
            let head = unsafe { &mut *head };
            let mut first = *head;
            // Safety: nodes reachable from `head` are alive until dequeued
            let mut next = unsafe { first.as_ref().next.load(Ordering::Acquire) };

            if first == self.stub {
                let Some(n) = NonNull::new(next) else {
                    return Err(TryDequeueError::Empty);
                };
                *head = n;
                first = n;
                // Safety: see above
                next = unsafe { n.as_ref().next.load(Ordering::Acquire) };
            }

            if let Some(n) = NonNull::new(next) {
                *head = n;
                return Ok(first);
            }

            let tail = self.tail.load(Ordering::Acquire).map_addr(|addr| addr & !PARKED);
            if first.as_ptr() != tail {
                return Err(TryDequeueError::Inconsistent);
            }

            // `first` is the last node. Put the stub behind it so it can be
            // taken without leaving the queue without a node.
            self.enqueue(self.stub);

            // Safety: see above
            next = unsafe { first.as_ref().next.load(Ordering::Acquire) };
            if let Some(n) = NonNull::new(next) {
                *head = n;
                return Ok(first);
            }

            Err(TryDequeueError::Inconsistent)
        })
    }

    /// Marks the consumer as parked.
    ///
    /// Only valid right after [`Self::try_dequeue`] returned
    /// [`TryDequeueError::Empty`]. Returns `false` if a producer got in
    /// first, in which case the consumer must not sleep and should retry.
    ///
    /// # Safety
    ///
    /// Must only be called by the single consumer.
    pub(crate) unsafe fn try_park(&self) -> bool {
        let stub = self.stub.as_ptr();
        self.tail
            .compare_exchange(
                stub,
                stub.map_addr(|addr| addr | PARKED),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn is_stub(&self, node: NonNull<Header>) -> bool {
        node == self.stub
    }
}

impl Drop for ReadyQueue {
    fn drop(&mut self) {
        // Safety: the stub was leaked from a box in `new` and nothing can
        // reference it once the queue is gone.
        drop(unsafe { Box::from_raw(self.stub.as_ptr()) });
    }
}

impl fmt::Debug for ReadyQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadyQueue")
            .field("tail", &self.tail)
            .field("stub", &self.stub)
            .finish_non_exhaustive()
    }
}
