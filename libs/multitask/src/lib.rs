// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A cooperative M:N task runtime.
//!
//! Many lightweight tasks are multiplexed over a small number of OS threads.
//! Every runtime thread owns a single-threaded scheduler that switches
//! between its tasks only at explicit suspension points: [`task::yield_now`],
//! [`task::exit`] and the blocking paths of the primitives in [`sync`],
//! [`chan`], [`time`] and [`io`]. There is no preemption and tasks never
//! migrate between threads, but any thread may wake a task parked on
//! another one.
//!
//! ```no_run
//! use multitask::chan::Chan;
//! use std::rc::Rc;
//!
//! let answer = multitask::run(|| {
//!     let chan = Rc::new(Chan::new(0));
//!     let tx = chan.clone();
//!     multitask::task::spawn(move || tx.send(42).unwrap()).unwrap();
//!     chan.recv().unwrap()
//! });
//! assert_eq!(answer, 42);
//! ```
//!
//! Blocking OS calls are bridged through [`io::IoChan`], which runs them on a
//! helper thread and supports cancellation, and timeouts go through
//! [`time::TimeoutChan`].

mod error;
mod loom;
mod park;
mod scheduler;
#[cfg(all(test, not(loom)))]
mod test_util;
mod thread;

pub mod chan;
pub mod io;
pub mod sync;
pub mod task;
pub mod time;

pub use error::Error;
pub use thread::{run, spawn_thread};
