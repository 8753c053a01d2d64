// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::sync::{Lock, Mutex, WaitList};
use crate::task;

/// A bare FIFO of parked tasks.
///
/// There is no stored notification: a [`WaitQueue::wake`] with nobody
/// waiting is lost.
#[derive(Debug, Default)]
pub struct WaitQueue {
    waiters: Mutex<WaitList>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: Mutex::const_new(Lock::new(), WaitList::new()),
        }
    }

    /// Parks the current task until a later [`WaitQueue::wake`] reaches it.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a runtime thread.
    pub fn wait(&self) {
        let mut waiters = self.waiters.lock();
        waiters.push_back(task::dequeue());
        drop(waiters);
        task::park();
    }

    /// Wakes up to `n` waiters in the order they parked.
    ///
    /// Returns how many were actually woken.
    pub fn wake(&self, n: usize) -> usize {
        let mut batch = WaitList::new();
        let mut waiters = self.waiters.lock();
        while batch.len() < n
            && let Some(task) = waiters.pop_front()
        {
            batch.push_back(task);
        }
        drop(waiters);

        let woken = batch.len();
        while let Some(task) = batch.pop_front() {
            task.wake();
        }
        woken
    }

    /// Wakes every waiter, returning how many there were.
    pub fn wake_all(&self) -> usize {
        self.wake(usize::MAX)
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::test_util::trace_init;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn wake_counts_and_order() {
        let _trace = trace_init();

        let order = crate::run(|| {
            let queue = Rc::new(WaitQueue::new());
            let order = Rc::new(RefCell::new(Vec::new()));

            assert_eq!(queue.wake(3), 0);

            for i in 0..4 {
                let queue = queue.clone();
                let order = order.clone();
                task::spawn(move || {
                    queue.wait();
                    order.borrow_mut().push(i);
                })
                .unwrap();
            }
            task::yield_now();
            assert_eq!(queue.len(), 4);

            assert_eq!(queue.wake(3), 3);
            task::yield_now();
            assert_eq!(*order.borrow(), [0, 1, 2]);

            assert_eq!(queue.wake_all(), 1);
            assert!(queue.is_empty());
            while Rc::strong_count(&order) > 1 {
                task::yield_now();
            }
            order.take()
        });

        assert_eq!(order, [0, 1, 2, 3]);
    }
}
