// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::sync::{Mutex, WaitList};
use crate::task::{self, TaskRef};
use core::sync::atomic::{AtomicBool, Ordering};

pub type QMutex<T> = lock_api::Mutex<QLock, T>;
pub type QMutexGuard<'a, T> = lock_api::MutexGuard<'a, QLock, T>;

/// A queueing lock that parks contending tasks instead of spinning.
///
/// Waiters are served strictly in FIFO order. On unlock, ownership passes
/// straight to the first waiter, the lock never becomes free in between.
#[derive(Debug, Default)]
pub struct QLock {
    locked: AtomicBool,
    pub(super) waiters: Mutex<WaitList>,
}

impl QLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            waiters: Mutex::const_new(super::Lock::new(), WaitList::new()),
        }
    }

    /// Acquires the lock, parking the current task while it is held
    /// elsewhere.
    ///
    /// # Panics
    ///
    /// Panics on contention when called outside of a runtime thread.
    pub fn lock(&self) {
        if self.try_lock() {
            return;
        }

        let mut waiters = self.waiters.lock();
        // The holder may have let go while we took the list lock. It clears
        // `locked` under that same lock, so checking here can't miss it.
        if self.try_lock() {
            return;
        }
        waiters.push_back(task::dequeue());
        drop(waiters);

        task::park();
        debug_assert!(self.is_locked());
    }

    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Releases the lock, handing it to the first waiter if there is one.
    ///
    /// # Safety
    ///
    /// The lock must be held by the current task.
    pub unsafe fn unlock(&self) {
        let mut waiters = self.waiters.lock();
        let next = self.release_locked(&mut waiters);
        drop(waiters);

        if let Some(next) = next {
            next.wake();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Gives up ownership while the waiter list is locked.
    ///
    /// Returns the waiter that now owns the lock, the caller must wake it
    /// once the list lock is dropped.
    pub(super) fn release_locked(&self, waiters: &mut WaitList) -> Option<TaskRef> {
        debug_assert!(self.is_locked());
        let next = waiters.pop_front();
        if next.is_none() {
            self.locked.store(false, Ordering::Release);
        }
        next
    }

    /// Makes `task` the owner if the lock is free, otherwise queues it ahead
    /// of everyone else.
    ///
    /// Returns `true` if the caller must wake `task`.
    pub(super) fn grant_or_requeue_locked(&self, waiters: &mut WaitList, task: TaskRef) -> bool {
        if self.try_lock() {
            true
        } else {
            waiters.push_front(task);
            false
        }
    }
}

// Safety: acquisition goes through the same false->true transition as
// `try_lock`, and unlock hands ownership over to exactly one waiter.
unsafe impl lock_api::RawMutex for QLock {
    #[allow(clippy::declare_interior_mutable_const, reason = "required by lock_api")]
    const INIT: Self = Self::new();

    // The owner is tracked per task, not per thread, but a guard must not be
    // dropped on a different thread's task.
    type GuardMarker = lock_api::GuardNoSend;

    fn lock(&self) {
        QLock::lock(self);
    }

    fn try_lock(&self) -> bool {
        QLock::try_lock(self)
    }

    unsafe fn unlock(&self) {
        // Safety: ensured by caller
        unsafe { QLock::unlock(self) }
    }

    fn is_locked(&self) -> bool {
        QLock::is_locked(self)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::test_util::trace_init;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;
    use std::sync::mpsc;

    #[test]
    fn waiters_acquire_in_fifo_order() {
        let _trace = trace_init();

        let order = crate::run(|| {
            let lock = Rc::new(QLock::new());
            let order = Rc::new(RefCell::new(Vec::new()));

            lock.lock();
            for i in 0..5 {
                let lock = lock.clone();
                let order = order.clone();
                task::spawn(move || {
                    lock.lock();
                    order.borrow_mut().push(i);
                    task::yield_now();
                    // Safety: taken above
                    unsafe { lock.unlock() };
                })
                .unwrap();
            }

            // Everybody queues up behind us.
            task::yield_now();
            assert!(lock.is_locked());
            assert!(order.borrow().is_empty());
            // Safety: taken above
            unsafe { lock.unlock() };

            while Rc::strong_count(&order) > 1 {
                task::yield_now();
            }
            assert!(!lock.is_locked());
            order.take()
        });

        assert_eq!(order, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn try_lock_does_not_queue() {
        let _trace = trace_init();

        crate::run(|| {
            let lock = QLock::new();
            assert!(lock.try_lock());
            assert!(!lock.try_lock());
            assert_eq!(lock.waiters.lock().len(), 0);
            // Safety: taken above
            unsafe { lock.unlock() };
            assert!(!lock.is_locked());
        });
    }

    #[test]
    fn qmutex_across_threads() {
        const THREADS: usize = 4;
        const TASKS: usize = 8;
        const ITERS: usize = 200;

        let _trace = trace_init();
        let m = Arc::new(QMutex::new(0_usize));
        let (tx, rx) = mpsc::channel();

        for _ in 0..THREADS {
            let m = m.clone();
            let tx = tx.clone();
            crate::spawn_thread(move || {
                for _ in 0..TASKS {
                    let m = m.clone();
                    let tx = tx.clone();
                    task::spawn(move || {
                        for _ in 0..ITERS {
                            let mut guard = m.lock();
                            let seen = *guard;
                            task::yield_now();
                            *guard = seen + 1;
                        }
                        tx.send(()).unwrap();
                    })
                    .unwrap();
                }
            })
            .unwrap();
        }
        drop(tx);

        assert_eq!(rx.iter().count(), THREADS * TASKS);
        // Every task let go of the lock, so this never has to park.
        assert_eq!(*m.try_lock().unwrap(), THREADS * TASKS * ITERS);
    }
}
