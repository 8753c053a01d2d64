// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Deadlines.
//!
//! A [`TimeQueue`] is a 4-ary min-heap of `(item, deadline)` pairs, serviced
//! by one dedicated OS thread that calls [`Timed::expire`] on every item
//! whose deadline passed. Each item caches its own heap index in a
//! [`TimerSlot`], so removal never scans.
//!
//! All timeout channels and IO alarms share one process-wide queue.

mod timeout;

pub use timeout::{TimeoutChan, sleep};

use crate::Error;
use core::fmt;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const ARITY: usize = 4;
/// The heap array never shrinks below this many entries.
const MIN_CAPACITY: usize = 16;
/// Delays are clamped to this so deadlines never overflow `Instant`.
const MAX_DELAY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Something that can sit in a [`TimeQueue`].
pub trait Timed: Send + Sync + 'static {
    /// Where the queue keeps this item's heap index.
    fn timer_slot(&self) -> &TimerSlot;

    /// Called on the service thread once the deadline passed, with the heap
    /// locked. Returning `Some(delay)` re-arms the item.
    ///
    /// Must not call back into the queue.
    fn expire(&self) -> Option<Duration>;

    /// Drops any notification `expire` left behind, see [`Remove::FLUSH`].
    fn flush(&self) {}
}

/// An item's position in its [`TimeQueue`], if it is queued.
#[derive(Debug)]
pub struct TimerSlot(AtomicUsize);

impl TimerSlot {
    const NONE: usize = usize::MAX;

    pub const fn new() -> Self {
        Self(AtomicUsize::new(Self::NONE))
    }

    pub fn is_queued(&self) -> bool {
        self.get().is_some()
    }

    fn get(&self) -> Option<usize> {
        // Only written with the heap locked
        match self.0.load(Ordering::Relaxed) {
            Self::NONE => None,
            index => Some(index),
        }
    }

    fn set(&self, index: Option<usize>) {
        self.0.store(index.unwrap_or(Self::NONE), Ordering::Relaxed);
    }
}

impl Default for TimerSlot {
    fn default() -> Self {
        Self::new()
    }
}

bitflags::bitflags! {
    /// Extra work for [`TimeQueueGuard::remove`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Remove: u8 {
        /// Give back the slot taken by [`TimeQueue::reserve`].
        const FREE = 1 << 0;
        /// Call [`Timed::flush`] so the item can be re-armed cleanly.
        const FLUSH = 1 << 1;
    }
}

struct Entry<T: ?Sized> {
    deadline: Instant,
    item: Arc<T>,
}

struct Core<T: ?Sized> {
    heap: Vec<Entry<T>>,
    /// Number of items that may be queued at once.
    reserved: usize,
    stop: bool,
    #[cfg(test)]
    rounds: usize,
}

struct Shared<T: ?Sized> {
    core: Mutex<Core<T>>,
    cond: Condvar,
}

/// A deadline-ordered queue with its own service thread.
pub struct TimeQueue<T: ?Sized + Timed> {
    shared: Arc<Shared<T>>,
    thread: Option<JoinHandle<()>>,
}

/// Exclusive access to a [`TimeQueue`]'s heap.
///
/// Wakes the service thread when dropped if an insert produced a new
/// earliest deadline.
pub struct TimeQueueGuard<'a, T: ?Sized + Timed> {
    core: MutexGuard<'a, Core<T>>,
    cond: &'a Condvar,
    notify: bool,
}

static SHARED_QUEUE: OnceLock<Option<TimeQueue<dyn Timed>>> = OnceLock::new();

/// The process-wide queue, started on first use.
///
/// # Errors
///
/// Returns [`Error::TimerUnavailable`] if the service thread could not be
/// started, on this and every later call.
pub(crate) fn shared_queue() -> Result<&'static TimeQueue<dyn Timed>, Error> {
    SHARED_QUEUE
        .get_or_init(|| match TimeQueue::new() {
            Ok(queue) => Some(queue),
            Err(err) => {
                tracing::error!(%err, "failed to start the timer service");
                None
            }
        })
        .as_ref()
        .ok_or(Error::TimerUnavailable)
}

impl<T: ?Sized + Timed> TimeQueue<T> {
    /// Starts a queue and its service thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Thread`] if the service thread cannot be spawned.
    pub fn new() -> Result<Self, Error> {
        let shared = Arc::new(Shared {
            core: Mutex::new(Core::new()),
            cond: Condvar::new(),
        });

        let thread = std::thread::Builder::new()
            .name("multitask-timer".into())
            .spawn({
                let shared = shared.clone();
                move || shared.service()
            })
            .map_err(Error::Thread)?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn lock(&self) -> TimeQueueGuard<'_, T> {
        TimeQueueGuard {
            core: self.shared.core.lock(),
            cond: &self.shared.cond,
            notify: false,
        }
    }

    /// Makes room for one more queued item.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Alloc`] if the heap array cannot grow.
    pub fn reserve(&self) -> Result<(), Error> {
        self.lock().core.reserve()
    }

    /// Gives back a slot taken by [`Self::reserve`].
    pub fn release(&self) {
        self.lock().core.release();
    }

    /// Queues `item` to expire after `delay`, replacing an earlier deadline.
    pub fn insert(&self, item: Arc<T>, delay: Duration) {
        self.lock().insert(item, delay);
    }

    /// Takes `item` out of the queue, returning whether it was queued.
    pub fn remove(&self, item: &T, flags: Remove) -> bool {
        self.lock().remove(item, flags)
    }

    pub fn len(&self) -> usize {
        self.lock().core.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current size of the heap array.
    pub fn capacity(&self) -> usize {
        self.lock().core.heap.capacity()
    }
}

impl<T: ?Sized + Timed> fmt::Debug for TimeQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.shared.core.lock();
        f.debug_struct("TimeQueue")
            .field("len", &core.heap.len())
            .field("reserved", &core.reserved)
            .field("capacity", &core.heap.capacity())
            .finish_non_exhaustive()
    }
}

impl<T: ?Sized + Timed> Drop for TimeQueue<T> {
    fn drop(&mut self) {
        self.shared.core.lock().stop = true;
        self.shared.cond.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl<T: ?Sized + Timed> TimeQueueGuard<'_, T> {
    /// Queues `item` to expire after `delay`. An earlier registration of the
    /// same item is dropped first.
    ///
    /// # Panics
    ///
    /// Panics if no slot was reserved for the item.
    pub fn insert(&mut self, item: Arc<T>, delay: Duration) {
        let deadline = Instant::now() + delay.min(MAX_DELAY);
        self.core.remove(&item);
        if self.core.insert(item, deadline) {
            self.notify = true;
        }
    }

    /// Takes `item` out of the queue and does the extra work named by
    /// `flags`. Returns whether the item was queued.
    pub fn remove(&mut self, item: &T, flags: Remove) -> bool {
        let was_queued = self.core.remove(item);
        if flags.contains(Remove::FREE) {
            self.core.release();
        }
        if flags.contains(Remove::FLUSH) {
            item.flush();
        }
        was_queued
    }
}

impl<T: ?Sized + Timed> Drop for TimeQueueGuard<'_, T> {
    fn drop(&mut self) {
        if self.notify {
            self.cond.notify_one();
        }
    }
}

impl<T: ?Sized + Timed> Shared<T> {
    fn service(&self) {
        tracing::debug!("timer service started");
        let mut core = self.core.lock();
        let mut rearm = Vec::new();

        while !core.stop {
            #[cfg(test)]
            {
                core.rounds += 1;
            }

            let now = Instant::now();
            while let Some(item) = core.pop_expired(now) {
                tracing::trace!("timer expired");
                if let Some(delay) = item.expire() {
                    rearm.push((item, delay));
                }
            }
            // Re-armed items only go back in once the sweep is done, a zero
            // delay would otherwise expire again in the same sweep.
            let now = Instant::now();
            for (item, delay) in rearm.drain(..) {
                core.insert(item, now + delay.min(MAX_DELAY));
            }

            match core.next_deadline() {
                None => self.cond.wait(&mut core),
                Some(deadline) => {
                    self.cond.wait_until(&mut core, deadline);
                }
            }
        }
        tracing::debug!("timer service stopped");
    }
}

impl<T: ?Sized + Timed> Core<T> {
    fn new() -> Self {
        Self {
            heap: Vec::new(),
            reserved: 0,
            stop: false,
            #[cfg(test)]
            rounds: 0,
        }
    }

    fn reserve(&mut self) -> Result<(), Error> {
        let cap = self.heap.capacity();
        if self.reserved == cap {
            let new_cap = (cap * 2).max(MIN_CAPACITY);
            self.heap
                .try_reserve_exact(new_cap - self.heap.len())
                .map_err(|_| Error::out_of_memory())?;
        }
        self.reserved += 1;
        Ok(())
    }

    fn release(&mut self) {
        debug_assert!(self.reserved > 0, "timer slot released twice");
        self.reserved -= 1;
        let cap = self.heap.capacity();
        if self.reserved < cap / 4 && cap / 2 >= MIN_CAPACITY {
            self.heap.shrink_to(cap / 2);
        }
    }

    /// Returns whether `item` became the earliest entry.
    fn insert(&mut self, item: Arc<T>, deadline: Instant) -> bool {
        assert!(
            self.heap.len() < self.reserved,
            "time queue insert without a reserved slot"
        );
        debug_assert!(item.timer_slot().get().is_none());

        let index = self.heap.len();
        item.timer_slot().set(Some(index));
        self.heap.push(Entry { deadline, item });
        self.sift_up(index) == 0
    }

    fn remove(&mut self, item: &T) -> bool {
        let Some(index) = item.timer_slot().get() else {
            return false;
        };
        debug_assert!(
            ptr::addr_eq(Arc::as_ptr(&self.heap[index].item), item),
            "timer slot points at a different item"
        );
        self.remove_at(index);
        true
    }

    fn remove_at(&mut self, index: usize) -> Arc<T> {
        let last = self.heap.len() - 1;
        self.swap(index, last);
        let entry = self.heap.pop().expect("heap is not empty");
        entry.item.timer_slot().set(None);

        if index < self.heap.len() {
            let index = self.sift_up(index);
            self.sift_down(index);
        }
        entry.item
    }

    fn pop_expired(&mut self, now: Instant) -> Option<Arc<T>> {
        if self.heap.first()?.deadline > now {
            return None;
        }
        Some(self.remove_at(0))
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.heap.first().map(|e| e.deadline)
    }

    fn sift_up(&mut self, mut index: usize) -> usize {
        while index > 0 {
            let parent = (index - 1) / ARITY;
            if self.heap[parent].deadline <= self.heap[index].deadline {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
        index
    }

    fn sift_down(&mut self, mut index: usize) {
        loop {
            let first = index * ARITY + 1;
            let Some(min) = (first..self.heap.len().min(first + ARITY))
                .min_by_key(|&child| self.heap[child].deadline)
            else {
                return;
            };
            if self.heap[index].deadline <= self.heap[min].deadline {
                return;
            }
            self.swap(index, min);
            index = min;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.heap[a].item.timer_slot().set(Some(a));
        self.heap[b].item.timer_slot().set(Some(b));
    }
}
