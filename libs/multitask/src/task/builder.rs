// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::Error;
use crate::scheduler::Scheduler;
use crate::task::{DEFAULT_STACK_SIZE, Id, Task};
use crate::thread;

/// Configures tasks and runtime threads before they are created.
///
/// ```no_run
/// use multitask::task::Builder;
///
/// multitask::run(|| {
///     Builder::new()
///         .name("worker")
///         .stack_size(64 * 1024)
///         .spawn(|| println!("hello from a small stack"))
///         .unwrap();
/// });
/// ```
#[derive(Debug, Clone)]
pub struct Builder<'a> {
    pub(crate) name: Option<&'a str>,
    pub(crate) stack_size: usize,
}

impl Default for Builder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Builder<'a> {
    pub const fn new() -> Self {
        Self {
            name: None,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    /// Override the name of tasks spawned by this builder.
    ///
    /// By default, tasks are unnamed. The name shows up in the task's span
    /// and, for [`Builder::spawn_thread`], as the OS thread name.
    #[must_use]
    pub fn name(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    /// Override the stack size of tasks spawned by this builder.
    ///
    /// Defaults to [`DEFAULT_STACK_SIZE`]. Requests below
    /// [`MIN_STACK_SIZE`](crate::task::MIN_STACK_SIZE) are rounded up.
    #[must_use]
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    /// Spawns a task on the current runtime thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Alloc`] when the task's stack can't be mapped.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a runtime thread.
    pub fn spawn<F>(&self, f: F) -> Result<Id, Error>
    where
        F: FnOnce() + 'static,
    {
        Scheduler::with_current(|scheduler| {
            let task = Task::new(scheduler.clone(), self, Box::new(f))?;
            let id = task.id();
            scheduler.spawn(task);
            Ok(id)
        })
    }

    /// Starts a new runtime thread with `f` as its first task.
    ///
    /// The thread is detached and exits once all of its tasks did.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Alloc`] when the first task's stack can't be mapped
    /// and [`Error::Thread`] when the OS refuses to create the thread.
    pub fn spawn_thread<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        thread::spawn_with(self, f)
    }

    /// Turns the calling OS thread into a runtime thread until `f` and every
    /// task it spawned have exited, then returns `f`'s result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Alloc`] when the first task's stack can't be mapped.
    ///
    /// # Panics
    ///
    /// Re-raises the first panic of any task on this thread. Also panics when
    /// the calling thread already is a runtime thread, or when `f` ends
    /// through [`task::exit`](crate::task::exit) instead of returning.
    pub fn run<F, R>(&self, f: F) -> Result<R, Error>
    where
        F: FnOnce() -> R + 'static,
        R: 'static,
    {
        thread::run_with(self, f)
    }
}
