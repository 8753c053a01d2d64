// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::sync::{Lock, Mutex, WaitList};
use crate::task::{self, Payload, TaskRef};
use core::sync::atomic::{AtomicU32, Ordering};

/// Counter value while a writer holds the lock.
const WRITER: u32 = u32::MAX;
/// Readers beyond this park until one of the others leaves.
const MAX_READERS: u32 = WRITER - 2;

pub type QRwLock<T> = lock_api::RwLock<RwLock, T>;
pub type QRwLockReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, RwLock, T>;
pub type QRwLockWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, RwLock, T>;

/// How a parked task wants to hold a [`RwLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Read,
    Write,
}

/// A read/write lock that parks contending tasks.
///
/// A single counter tracks the holders: `0` is free, up to `u32::MAX - 2`
/// counts readers, and `u32::MAX` marks a writer. Contenders park in one FIFO
/// list, tagged with the access they want. Woken tasks race for the counter
/// again and return to the front of the list if they lose.
#[derive(Debug, Default)]
pub struct RwLock {
    state: AtomicU32,
    waiters: Mutex<WaitList>,
}

impl RwLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
            waiters: Mutex::const_new(Lock::new(), WaitList::new()),
        }
    }

    pub fn try_read(&self) -> bool {
        let mut cur = self.state.load(Ordering::Relaxed);
        loop {
            if cur >= MAX_READERS {
                return false;
            }
            match self.state.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn try_write(&self) -> bool {
        self.state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquires shared access, parking the current task while a writer holds
    /// the lock.
    pub fn read(&self) {
        if self.try_read() {
            return;
        }
        self.park_until(Access::Read, Self::try_read);

        // Readers queued right behind us can share the lock as well.
        let mut waiters = self.waiters.lock();
        let next = pop_if_reader(&mut waiters);
        drop(waiters);
        if let Some(next) = next {
            next.wake();
        }
    }

    /// Acquires exclusive access, parking the current task while the lock is
    /// held in any way.
    pub fn write(&self) {
        if self.try_write() {
            return;
        }
        self.park_until(Access::Write, Self::try_write);
    }

    /// # Safety
    ///
    /// The current task must hold shared access.
    pub unsafe fn read_unlock(&self) {
        let prev = self.state.fetch_sub(1, Ordering::Release);
        debug_assert!(prev != 0 && prev != WRITER, "read_unlock without readers");

        let mut waiters = self.waiters.lock();
        let next = match pop_if_reader(&mut waiters) {
            Some(reader) => Some(reader),
            // The last reader lets whoever is first in line try next.
            None if prev == 1 => waiters.pop_front(),
            None => None,
        };
        drop(waiters);

        if let Some(next) = next {
            next.wake();
        }
    }

    /// # Safety
    ///
    /// The current task must hold exclusive access.
    pub unsafe fn write_unlock(&self) {
        debug_assert_eq!(self.state.load(Ordering::Relaxed), WRITER);
        self.state.store(0, Ordering::Release);

        let next = self.waiters.lock().pop_front();
        if let Some(next) = next {
            next.wake();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != 0
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) == WRITER
    }

    fn park_until(&self, access: Access, try_acquire: fn(&Self) -> bool) {
        let mut requeue = false;
        loop {
            let mut waiters = self.waiters.lock();
            // Unlockers change the counter before taking the list lock, so
            // a release can't slip in between this check and parking.
            if try_acquire(self) {
                return;
            }

            let me = task::dequeue();
            // Safety: we are the task
            unsafe { me.set_payload(Payload::Access(access)) };
            if requeue {
                waiters.push_front(me);
            } else {
                waiters.push_back(me);
            }
            drop(waiters);

            task::park();
            // Safety: we are the task, and nobody holds us anymore
            unsafe { me.set_payload(Payload::None) };

            if try_acquire(self) {
                return;
            }
            requeue = true;
        }
    }
}

fn pop_if_reader(waiters: &mut WaitList) -> Option<TaskRef> {
    let front = waiters.front()?;
    // Safety: the list owns its parked tasks
    let access = unsafe { front.payload() };
    if access == Payload::Access(Access::Read) {
        waiters.pop_front()
    } else {
        None
    }
}

// Safety: writers only get in on the 0->WRITER transition, readers only
// while the counter is below WRITER.
unsafe impl lock_api::RawRwLock for RwLock {
    #[allow(clippy::declare_interior_mutable_const, reason = "required by lock_api")]
    const INIT: Self = Self::new();

    type GuardMarker = lock_api::GuardNoSend;

    fn lock_shared(&self) {
        self.read();
    }

    fn try_lock_shared(&self) -> bool {
        self.try_read()
    }

    unsafe fn unlock_shared(&self) {
        // Safety: ensured by caller
        unsafe { self.read_unlock() }
    }

    fn lock_exclusive(&self) {
        self.write();
    }

    fn try_lock_exclusive(&self) -> bool {
        self.try_write()
    }

    unsafe fn unlock_exclusive(&self) {
        // Safety: ensured by caller
        unsafe { self.write_unlock() }
    }

    fn is_locked(&self) -> bool {
        RwLock::is_locked(self)
    }

    fn is_locked_exclusive(&self) -> bool {
        self.is_write_locked()
    }
}
