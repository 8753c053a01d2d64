// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::{Remove, TimeQueue, Timed, TimerSlot, shared_queue};
use crate::Error;
use crate::chan::Chan;
use core::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A channel that receives one message once its timer runs out.
///
/// ```no_run
/// use multitask::time::TimeoutChan;
/// use std::time::Duration;
///
/// multitask::run(|| {
///     let timeout = TimeoutChan::new().unwrap();
///     timeout.arm(Duration::from_millis(5));
///     // ... do other work ...
///     timeout.recv();
/// });
/// ```
pub struct TimeoutChan {
    inner: Arc<Timeout>,
    queue: &'static TimeQueue<dyn Timed>,
}

struct Timeout {
    chan: Chan<()>,
    slot: TimerSlot,
}

impl Timed for Timeout {
    fn timer_slot(&self) -> &TimerSlot {
        &self.slot
    }

    fn expire(&self) -> Option<Duration> {
        // Full means an earlier expiry was never received, one is enough.
        let _ = self.chan.try_send(());
        None
    }

    fn flush(&self) {
        while self.chan.try_recv().is_ok() {}
    }
}

impl TimeoutChan {
    /// # Errors
    ///
    /// Returns [`Error::TimerUnavailable`] if the timer service is not
    /// running and [`Error::Alloc`] if no room can be made for the timer.
    pub fn new() -> Result<Self, Error> {
        let queue = shared_queue()?;
        queue.reserve()?;
        Ok(Self {
            inner: Arc::new(Timeout {
                chan: Chan::new(1),
                slot: TimerSlot::new(),
            }),
            queue,
        })
    }

    /// Arms the timer to fire after `timeout`.
    ///
    /// A pending expiry, fired or not, is cancelled. A zero `timeout` only
    /// disarms.
    pub fn arm(&self, timeout: Duration) {
        let mut queue = self.queue.lock();
        queue.remove(&*self.inner, Remove::FLUSH);
        if !timeout.is_zero() {
            queue.insert(self.inner.clone(), timeout);
        }
    }

    /// Parks the current task for `duration`.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a runtime thread.
    pub fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        self.arm(duration);
        self.recv();
    }

    /// Parks the current task until the timer fires.
    ///
    /// Never returns if the timer is not armed and has not fired.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a runtime thread.
    pub fn recv(&self) {
        let fired = self.inner.chan.recv();
        debug_assert!(fired.is_some(), "timeout channels are never closed");
    }

    /// Returns whether the timer fired since it was last armed, consuming
    /// the expiry.
    pub fn try_recv(&self) -> bool {
        self.inner.chan.try_recv().is_ok()
    }

    pub fn is_armed(&self) -> bool {
        self.inner.slot.is_queued()
    }

    /// The channel the expiry is delivered on.
    pub fn chan(&self) -> &Chan<()> {
        &self.inner.chan
    }
}

impl fmt::Debug for TimeoutChan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutChan")
            .field("armed", &self.is_armed())
            .field("fired", &!self.inner.chan.is_empty())
            .finish_non_exhaustive()
    }
}

impl Drop for TimeoutChan {
    fn drop(&mut self) {
        self.queue.remove(&*self.inner, Remove::FREE);
    }
}

/// Parks the current task for at least `duration`.
///
/// # Errors
///
/// Returns an error if no timeout channel could be created, see
/// [`TimeoutChan::new`].
///
/// # Panics
///
/// Panics when called outside of a runtime thread.
pub fn sleep(duration: Duration) -> Result<(), Error> {
    TimeoutChan::new()?.sleep(duration);
    Ok(())
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::task;
    use crate::test_util::trace_init;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Instant;

    #[test]
    fn sleep_waits() {
        let _trace = trace_init();

        let elapsed = crate::run(|| {
            let start = Instant::now();
            sleep(Duration::from_millis(20)).unwrap();
            start.elapsed()
        });
        assert!(elapsed >= Duration::from_millis(20));
    }

    #[test]
    fn other_tasks_run_while_sleeping() {
        let _trace = trace_init();

        crate::run(|| {
            let ticks = Rc::new(Cell::new(0));
            let t = ticks.clone();
            let timeout = TimeoutChan::new().unwrap();
            timeout.arm(Duration::from_millis(20));

            task::spawn(move || {
                for _ in 0..10 {
                    t.set(t.get() + 1);
                    task::yield_now();
                }
            })
            .unwrap();

            timeout.recv();
            assert_eq!(ticks.get(), 10);
        });
    }

    #[test]
    fn rearm_cancels_pending_expiry() {
        let _trace = trace_init();

        crate::run(|| {
            let timeout = TimeoutChan::new().unwrap();
            timeout.arm(Duration::from_millis(1));
            std::thread::sleep(Duration::from_millis(20));
            // Fired, but not received yet.
            assert!(!timeout.is_armed());

            timeout.arm(Duration::from_secs(60));
            assert!(!timeout.try_recv());
            assert!(timeout.is_armed());

            timeout.arm(Duration::ZERO);
            assert!(!timeout.is_armed());
        });
    }

    #[test]
    fn fires_once_per_arm() {
        let _trace = trace_init();

        crate::run(|| {
            let timeout = TimeoutChan::new().unwrap();
            timeout.sleep(Duration::from_millis(5));
            assert!(!timeout.try_recv());
            timeout.sleep(Duration::from_millis(5));
            assert!(!timeout.try_recv());
        });
    }
}
