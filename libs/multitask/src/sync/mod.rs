// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Synchronization primitives.
//!
//! [`Lock`] blocks the whole OS thread and is the foundation everything else
//! builds on. All other primitives park only the calling task, so other
//! tasks on the same thread keep running while it waits.

mod backoff;
mod cond;
mod lock;
mod qlock;
mod queue;
mod refcount;
mod rendez;
pub(crate) mod rwlock;
mod wait_list;

pub use backoff::Backoff;
pub use cond::Cond;
pub use lock::{Lock, Mutex, MutexGuard};
pub use qlock::{QLock, QMutex, QMutexGuard};
pub use queue::WaitQueue;
pub use refcount::RefCount;
pub use rendez::{ARendez, rendez};
pub use rwlock::{QRwLock, QRwLockReadGuard, QRwLockWriteGuard, RwLock};
pub(crate) use wait_list::WaitList;
