// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::scheduler::Scheduler;
use crate::task;
use core::hint;

/// An [exponential backoff] for spin loops.
///
/// The ready queue spins on this while a producer is halfway through an
/// enqueue, and IO channel teardown snoozes on it while waiting for the
/// helper thread to settle.
///
/// [exponential backoff]: https://en.wikipedia.org/wiki/Exponential_backoff
#[derive(Debug, Copy, Clone)]
pub struct Backoff {
    exp: u8,
    max: u8,
}

// === impl Backoff ===

impl Backoff {
    /// The default maximum exponent (2^8).
    pub const DEFAULT_MAX_EXPONENT: u8 = 8;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            exp: 0,
            max: Self::DEFAULT_MAX_EXPONENT,
        }
    }

    /// Returns a new exponential backoff with the provided max exponent.
    ///
    /// # Panics
    ///
    /// Panics if the `max` exponent is larger than [`Self::DEFAULT_MAX_EXPONENT`].
    #[must_use]
    pub fn with_max_exponent(max: u8) -> Self {
        assert!(max <= Self::DEFAULT_MAX_EXPONENT);
        Self { exp: 0, max }
    }

    /// Issues `2^exp` [spin loop hints] and bumps the exponent until it hits
    /// the maximum.
    ///
    /// [spin loop hints]: hint::spin_loop
    #[inline(always)]
    pub fn spin(&mut self) {
        let spins = 1_u32 << self.exp;

        for _ in 0..spins {
            // loom needs the thread to yield back to it to make progress,
            // see https://github.com/tokio-rs/loom/issues/162#issuecomment-665128979
            #[cfg(loom)]
            crate::loom::thread::yield_now();

            hint::spin_loop();
        }

        if self.exp < self.max {
            self.exp += 1;
        }
    }

    /// Backs off like [`Self::spin`] until the exponent saturates, then
    /// gives other tasks on this thread a chance to run instead.
    ///
    /// Outside of a runtime thread, or when no other task is runnable, the
    /// OS thread yields.
    pub fn snooze(&mut self) {
        if !self.is_saturated() {
            self.spin();
            return;
        }

        if !Scheduler::is_runtime_thread() || task::yield_now() == 0 {
            std::thread::yield_now();
        }
    }

    /// Returns `true` once the exponent reached its maximum.
    #[must_use]
    pub fn is_saturated(&self) -> bool {
        self.exp >= self.max
    }

    #[inline(always)]
    pub fn reset(&mut self) {
        self.exp = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn saturates_at_max() {
        let mut b = Backoff::with_max_exponent(2);
        assert!(!b.is_saturated());
        b.spin();
        b.spin();
        assert!(b.is_saturated());
        b.spin();
        assert!(b.is_saturated());
        b.reset();
        assert!(!b.is_saturated());
    }

    #[test]
    fn snooze_outside_runtime() {
        let mut b = Backoff::with_max_exponent(0);
        b.snooze();
        b.snooze();
        assert!(b.is_saturated());
    }

    #[test]
    fn snooze_lets_other_tasks_run() {
        let _trace = crate::test_util::trace_init();

        let ran = crate::run(|| {
            let ran = std::rc::Rc::new(core::cell::Cell::new(false));
            let r = ran.clone();
            task::spawn(move || r.set(true)).unwrap();

            let mut b = Backoff::with_max_exponent(0);
            b.spin();
            b.snooze();
            ran.get()
        });
        assert!(ran);
    }
}
