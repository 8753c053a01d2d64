// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::hint;
use core::sync::atomic::{AtomicU32, Ordering};

/// How often [`Lock::lock`] retries before blocking the thread.
const SPIN_LIMIT: u32 = 200;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

pub type Mutex<T> = lock_api::Mutex<Lock, T>;
pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, Lock, T>;

/// A spin-then-block lock that blocks the whole OS thread.
///
/// Acquisition spins for a short while and then sleeps on the lock word
/// through the kernel's futex facility (or a short sleep where there is
/// none). It carries no owner and is not reentrant. Critical sections must be
/// short and must never reach a task suspension point.
#[derive(Debug)]
pub struct Lock {
    state: AtomicU32,
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl Lock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    pub fn lock(&self) {
        loop {
            for _ in 0..SPIN_LIMIT {
                if self.try_lock() {
                    return;
                }
                hint::spin_loop();
            }

            // The futex only hints that the word changed, so go back to
            // racing for it after every wakeup.
            futex::wait(&self.state, LOCKED);
        }
    }

    /// Attempts to take the lock without blocking.
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// The lock must be held by the caller's context.
    pub unsafe fn unlock(&self) {
        self.state.store(UNLOCKED, Ordering::Release);
        // There is no waiter count, so always issue the wake. A stray one
        // on an uncontended lock is harmless.
        futex::wake(&self.state);
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) == LOCKED
    }
}

// Safety: `lock`/`try_lock` only succeed after winning the unlocked->locked
// transition, which gives mutual exclusion.
unsafe impl lock_api::RawMutex for Lock {
    #[allow(clippy::declare_interior_mutable_const, reason = "required by lock_api")]
    const INIT: Self = Self::new();

    type GuardMarker = lock_api::GuardSend;

    fn lock(&self) {
        Lock::lock(self);
    }

    fn try_lock(&self) -> bool {
        Lock::try_lock(self)
    }

    unsafe fn unlock(&self) {
        // Safety: ensured by caller
        unsafe { Lock::unlock(self) }
    }

    fn is_locked(&self) -> bool {
        Lock::is_locked(self)
    }
}

mod futex {
    use core::sync::atomic::AtomicU32;

    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            use core::ptr;

            pub(super) fn wait(word: &AtomicU32, expected: u32) {
                // Safety: `word` is a valid, aligned u32 for the whole call.
                // The kernel rechecks it against `expected` before sleeping.
                unsafe {
                    libc::syscall(
                        libc::SYS_futex,
                        word.as_ptr(),
                        libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                        expected,
                        ptr::null::<libc::timespec>(),
                    );
                }
            }

            pub(super) fn wake(word: &AtomicU32) {
                // Safety: see above
                unsafe {
                    libc::syscall(
                        libc::SYS_futex,
                        word.as_ptr(),
                        libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                        1,
                    );
                }
            }
        } else {
            use core::sync::atomic::Ordering;
            use core::time::Duration;

            pub(super) fn wait(word: &AtomicU32, expected: u32) {
                if word.load(Ordering::Relaxed) == expected {
                    std::thread::sleep(Duration::from_micros(10));
                }
            }

            pub(super) fn wake(_word: &AtomicU32) {}
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn try_lock_never_blocks() {
        let lock = Lock::new();
        assert!(lock.try_lock());
        assert!(lock.is_locked());
        assert!(!lock.try_lock());
        // Safety: taken above
        unsafe { lock.unlock() };
        assert!(!lock.is_locked());
        assert!(lock.try_lock());
    }

    #[test]
    fn mutex_counts_across_threads() {
        const THREADS: usize = 4;
        const ITERS: usize = 10_000;

        let m = Arc::new(Mutex::new(0_usize));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let m = m.clone();
                thread::spawn(move || {
                    for _ in 0..ITERS {
                        *m.lock() += 1;
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*m.lock(), THREADS * ITERS);
    }

    #[test]
    fn blocked_thread_is_woken() {
        let m = Arc::new(Mutex::new(()));
        let guard = m.lock();

        let h = thread::spawn({
            let m = m.clone();
            move || drop(m.lock())
        });

        // Long enough for the other thread to give up spinning.
        thread::sleep(core::time::Duration::from_millis(20));
        drop(guard);
        h.join().unwrap();
    }
}
