// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use parking_lot::{Condvar, Mutex};

/// A counting semaphore that blocks the whole OS thread.
///
/// Schedulers sleep on this when none of their tasks are runnable, and the
/// IO bridge uses one to hand control between a task and its helper thread.
#[derive(Debug, Default)]
pub(crate) struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub(crate) const fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }

    pub(crate) fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn post_before_wait_does_not_block() {
        let sem = Semaphore::new();
        sem.post();
        sem.post();
        sem.wait();
        sem.wait();
    }

    #[test]
    fn wakes_other_thread() {
        let sem = Arc::new(Semaphore::new());
        let done = Arc::new(Semaphore::new());

        let h = thread::spawn({
            let sem = sem.clone();
            let done = done.clone();
            move || {
                sem.wait();
                done.post();
            }
        });

        sem.post();
        done.wait();
        h.join().unwrap();
    }
}
