// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::Error;
use crate::scheduler::Scheduler;
use crate::task::{Builder, Task, TaskRef};
use core::any::Any;
use core::cell::Cell;
use std::panic;
use std::rc::Rc;
use std::sync::Arc;

/// OS stack for runtime threads. Tasks run on their own stacks, this only
/// has to hold the scheduler's bookkeeping.
const ROOT_STACK_SIZE: usize = 128 * 1024;

/// Turns the calling OS thread into a runtime thread until `f` and every
/// task it spawned have exited, then returns `f`'s result.
///
/// This is a shorthand for [`Builder::run`] with default settings.
///
/// # Panics
///
/// Panics when the first task can't be allocated, and re-raises the first
/// panic of any task on this thread.
pub fn run<F, R>(f: F) -> R
where
    F: FnOnce() -> R + 'static,
    R: 'static,
{
    match Builder::new().run(f) {
        Ok(out) => out,
        Err(err) => panic!("failed to start runtime thread: {err}"),
    }
}

/// Starts a new detached runtime thread with `f` as its first task.
///
/// # Errors
///
/// See [`Builder::spawn_thread`].
pub fn spawn_thread<F>(f: F) -> Result<(), Error>
where
    F: FnOnce() + Send + 'static,
{
    Builder::new().spawn_thread(f)
}

/// A scheduler together with its not yet started first task.
struct Bootstrap {
    scheduler: Arc<Scheduler>,
    first: Option<TaskRef>,
}

// Safety: `spawn_with` only builds a bootstrap from a `Send` closure, and
// the task hasn't run yet, so nothing in it is tied to the creating thread.
unsafe impl Send for Bootstrap {}

impl Bootstrap {
    fn new(builder: &Builder<'_>, f: Box<dyn FnOnce()>) -> Result<Self, Error> {
        let scheduler = Scheduler::new();
        let first = Task::new(scheduler.clone(), builder, f)?;
        Ok(Self {
            scheduler,
            first: Some(first),
        })
    }

    fn run(mut self) -> Option<Box<dyn Any + Send>> {
        let first = self.first.take()?;
        self.scheduler.run(first)
    }
}

impl Drop for Bootstrap {
    fn drop(&mut self) {
        if let Some(task) = self.first.take() {
            // Safety: never started, so no stack frames live on it
            unsafe { task.free() };
        }
    }
}

pub(crate) fn run_with<F, R>(builder: &Builder<'_>, f: F) -> Result<R, Error>
where
    F: FnOnce() -> R + 'static,
    R: 'static,
{
    assert!(
        !Scheduler::is_runtime_thread(),
        "cannot start a runtime from within a runtime thread"
    );

    let out = Rc::new(Cell::new(None));
    let slot = out.clone();
    let boot = Bootstrap::new(builder, Box::new(move || slot.set(Some(f()))))?;

    if let Some(payload) = boot.run() {
        panic::resume_unwind(payload);
    }

    Ok(out
        .take()
        .expect("first task exited without returning a value"))
}

pub(crate) fn spawn_with<F>(builder: &Builder<'_>, f: F) -> Result<(), Error>
where
    F: FnOnce() + Send + 'static,
{
    let boot = Bootstrap::new(builder, Box::new(f))?;

    let mut os = std::thread::Builder::new().stack_size(ROOT_STACK_SIZE);
    if let Some(name) = builder.name {
        os = os.name(name.to_owned());
    }

    os.spawn(move || {
        if boot.run().is_some() {
            tracing::debug!("runtime thread ended after a task panicked");
        }
    })
    .map_err(Error::Thread)?;

    Ok(())
}
