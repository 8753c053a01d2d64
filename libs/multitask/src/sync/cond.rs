// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::sync::{QLock, WaitList};
use crate::task::{self, TaskRef};
use core::cell::UnsafeCell;
use core::fmt;
use std::sync::Arc;

/// A condition variable bound to one [`QLock`].
///
/// The waiter list is guarded by the lock's own internal list lock, so
/// moving a task from the condition to the lock's queue is a single step.
/// Signalled waiters go to the *front* of the lock's queue and therefore get
/// the lock before any task that started contending later.
pub struct Cond {
    lock: Arc<QLock>,
    /// Guarded by `lock.waiters`.
    waiters: UnsafeCell<WaitList>,
}

// Safety: `waiters` is only accessed while holding `lock.waiters`
unsafe impl Send for Cond {}
// Safety: see above
unsafe impl Sync for Cond {}

impl Cond {
    pub fn new(lock: Arc<QLock>) -> Self {
        Self {
            lock,
            waiters: UnsafeCell::new(WaitList::new()),
        }
    }

    /// The lock this condition is bound to.
    pub fn lock(&self) -> &Arc<QLock> {
        &self.lock
    }

    /// Releases the lock, parks until signalled, and returns with the lock
    /// held again.
    ///
    /// If other tasks are queued on the lock, the first of them gets it
    /// directly.
    ///
    /// # Safety
    ///
    /// The current task must hold the bound lock.
    pub unsafe fn wait(&self) {
        let mut lock_waiters = self.lock.waiters.lock();
        let me = task::dequeue();
        // Safety: guarded by the list lock we hold
        unsafe { (*self.waiters.get()).push_back(me) };
        let next = self.lock.release_locked(&mut lock_waiters);
        drop(lock_waiters);

        if let Some(next) = next {
            next.wake();
        }
        task::park();

        // Whoever signalled us either granted us the lock or queued us for it.
        debug_assert!(self.lock.is_locked());
    }

    /// Moves the longest waiting task over to the lock.
    ///
    /// Returns the number of woken tasks, `0` or `1`.
    pub fn signal(&self) -> usize {
        let mut lock_waiters = self.lock.waiters.lock();
        // Safety: guarded by the list lock we hold
        let Some(task) = (unsafe { (*self.waiters.get()).pop_front() }) else {
            return 0;
        };
        let wake = self.lock.grant_or_requeue_locked(&mut lock_waiters, task);
        drop(lock_waiters);

        if wake {
            task.wake();
        }
        1
    }

    /// Moves every waiting task over to the lock, in the order they started
    /// waiting.
    ///
    /// Returns how many tasks were moved.
    pub fn broadcast(&self) -> usize {
        let mut lock_waiters = self.lock.waiters.lock();
        // Safety: guarded by the list lock we hold
        let mut moved = core::mem::take(unsafe { &mut *self.waiters.get() });
        let count = moved.len();

        // If the lock is free the first waiter takes it right away, everybody
        // else queues up in front of the tasks already contending.
        let mut grant: Option<TaskRef> = None;
        if !moved.is_empty() && self.lock.try_lock() {
            grant = moved.pop_front();
        }
        lock_waiters.append_front(&mut moved);
        drop(lock_waiters);

        if let Some(task) = grant {
            task.wake();
        }
        count
    }

    /// Number of tasks currently waiting.
    pub fn len(&self) -> usize {
        let _guard = self.lock.waiters.lock();
        // Safety: guarded by the list lock we hold
        unsafe { (*self.waiters.get()).len() }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cond")
            .field("lock", &self.lock)
            .field("waiters", &self.len())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::test_util::trace_init;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    fn waiter(cond: &Rc<Cond>, id: usize, order: &Rc<RefCell<Vec<usize>>>, ready: &Rc<Cell<bool>>) {
        let cond = cond.clone();
        let order = order.clone();
        let ready = ready.clone();
        task::spawn(move || {
            cond.lock().lock();
            while !ready.get() {
                // Safety: lock held
                unsafe { cond.wait() };
            }
            order.borrow_mut().push(id);
            task::yield_now();
            // Safety: lock held
            unsafe { cond.lock().unlock() };
        })
        .unwrap();
    }

    #[test]
    fn signal_wakes_in_fifo_order() {
        let _trace = trace_init();

        let order = crate::run(|| {
            let cond = Rc::new(Cond::new(Arc::new(QLock::new())));
            let order = Rc::new(RefCell::new(Vec::new()));
            let ready = Rc::new(Cell::new(false));

            assert_eq!(cond.signal(), 0);
            for id in 0..3 {
                waiter(&cond, id, &order, &ready);
            }
            task::yield_now();
            assert_eq!(cond.len(), 3);
            assert!(!cond.lock().is_locked());

            ready.set(true);
            for _ in 0..3 {
                assert_eq!(cond.signal(), 1);
                task::yield_now();
            }
            assert_eq!(cond.signal(), 0);

            while Rc::strong_count(&order) > 1 {
                task::yield_now();
            }
            order.take()
        });

        assert_eq!(order, [0, 1, 2]);
    }

    #[test]
    fn broadcast_wakes_everyone_once() {
        let _trace = trace_init();

        let order = crate::run(|| {
            let cond = Rc::new(Cond::new(Arc::new(QLock::new())));
            let order = Rc::new(RefCell::new(Vec::new()));
            let ready = Rc::new(Cell::new(false));

            for id in 0..5 {
                waiter(&cond, id, &order, &ready);
            }
            task::yield_now();

            // Broadcast while holding the lock: everyone is queued behind us
            // and only gets in after we let go.
            cond.lock().lock();
            ready.set(true);
            assert_eq!(cond.broadcast(), 5);
            assert!(cond.is_empty());
            task::yield_now();
            assert!(order.borrow().is_empty());
            // Safety: taken above
            unsafe { cond.lock().unlock() };

            while Rc::strong_count(&order) > 1 {
                task::yield_now();
            }
            order.take()
        });

        assert_eq!(order, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn woken_waiters_go_before_new_contenders() {
        let _trace = trace_init();

        let order = crate::run(|| {
            let cond = Rc::new(Cond::new(Arc::new(QLock::new())));
            let order = Rc::new(RefCell::new(Vec::new()));
            let ready = Rc::new(Cell::new(false));

            waiter(&cond, 0, &order, &ready);
            task::yield_now();

            cond.lock().lock();
            // A fresh contender queues up on the lock before the signal.
            let late = {
                let cond = cond.clone();
                let order = order.clone();
                move || {
                    cond.lock().lock();
                    order.borrow_mut().push(1);
                    // Safety: lock held
                    unsafe { cond.lock().unlock() };
                }
            };
            task::spawn(late).unwrap();
            task::yield_now();

            ready.set(true);
            cond.signal();
            // Safety: taken above
            unsafe { cond.lock().unlock() };

            while Rc::strong_count(&order) > 1 {
                task::yield_now();
            }
            order.take()
        });

        assert_eq!(order, [0, 1]);
    }

    #[test]
    fn broadcast_races_waiters_from_other_threads() {
        const THREADS: usize = 2;
        const WAITERS: usize = 8;

        let _trace = trace_init();

        let cond = Arc::new(Cond::new(Arc::new(QLock::new())));
        let generation = Arc::new(AtomicUsize::new(0));
        let woken = Arc::new(AtomicUsize::new(0));

        for _ in 0..THREADS {
            let (cond, generation, woken) = (cond.clone(), generation.clone(), woken.clone());
            crate::spawn_thread(move || {
                for _ in 0..WAITERS {
                    let (cond, generation, woken) =
                        (cond.clone(), generation.clone(), woken.clone());
                    task::spawn(move || {
                        cond.lock().lock();
                        let seen = generation.load(Ordering::Relaxed);
                        while generation.load(Ordering::Relaxed) == seen {
                            // Safety: we hold the lock
                            unsafe { cond.wait() };
                        }
                        woken.fetch_add(1, Ordering::Relaxed);
                        // Safety: `wait` returns with the lock held
                        unsafe { cond.lock().unlock() };
                    })
                    .unwrap();
                    task::yield_now();
                }
            })
            .unwrap();
        }

        let broadcasts = crate::run(move || {
            let mut broadcasts = 0_usize;
            while woken.load(Ordering::Relaxed) < THREADS * WAITERS {
                cond.lock().lock();
                generation.fetch_add(1, Ordering::Relaxed);
                cond.broadcast();
                // Safety: taken above
                unsafe { cond.lock().unlock() };
                broadcasts += 1;
                task::yield_now();
            }
            assert!(cond.is_empty());
            broadcasts
        });
        assert!(broadcasts > 0);
    }
}
