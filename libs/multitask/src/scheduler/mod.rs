// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod queue;

pub(crate) use queue::Header;

use crate::park::Semaphore;
use crate::scheduler::queue::{ReadyQueue, TryDequeueError};
use crate::sync::Backoff;
use crate::task::TaskRef;
use core::any::Any;
use core::cell::{Cell, UnsafeCell};
use core::fmt;
use core::ptr;
use multitask_context::Context;
use std::sync::Arc;

type Panic = Box<dyn Any + Send + 'static>;

thread_local! {
    static CURRENT: Cell<*const Arc<Scheduler>> = const { Cell::new(ptr::null()) };
}

/// Per-thread scheduler state.
///
/// Exactly one scheduler drives each runtime thread. Any thread may push
/// tasks onto its ready queue through [`TaskRef::wake`], but everything else
/// in here is only ever touched by the owning thread.
pub(crate) struct Scheduler {
    run_queue: ReadyQueue,
    /// Blocks the owning thread while none of its tasks are runnable.
    sem: Semaphore,
    current: Cell<Option<TaskRef>>,
    /// Live tasks on this thread, including the current one.
    ntasks: Cell<usize>,
    /// Set when the current task took itself out of scheduling control.
    popped: Cell<bool>,
    switches: Cell<usize>,
    /// The OS thread's own context, resumed once the last task exits.
    root: UnsafeCell<Context>,
    panic: Cell<Option<Panic>>,
}

// Safety: the only state touched from other threads is the ready queue and
// the semaphore, which are both thread-safe. The cells are confined to the
// owning thread.
unsafe impl Send for Scheduler {}
// Safety: see above
unsafe impl Sync for Scheduler {}

// === impl Scheduler ===

impl Scheduler {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            run_queue: ReadyQueue::new(),
            sem: Semaphore::new(),
            current: Cell::new(None),
            ntasks: Cell::new(0),
            popped: Cell::new(false),
            switches: Cell::new(0),
            root: UnsafeCell::new(Context::empty()),
            panic: Cell::new(None),
        })
    }

    /// Calls `f` with the scheduler driving the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not a runtime thread.
    #[track_caller]
    pub(crate) fn with_current<R>(f: impl FnOnce(&Arc<Scheduler>) -> R) -> R {
        let ptr = CURRENT.get();
        assert!(
            !ptr.is_null(),
            "must be called from within a multitask runtime thread"
        );
        // Safety: `CURRENT` points at the `Arc` borrowed by `run` and is reset
        // before that borrow ends.
        f(unsafe { &*ptr })
    }

    /// Ends the task running on the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not a runtime thread.
    #[track_caller]
    pub(crate) fn exit_current() -> ! {
        let ptr = CURRENT.get();
        assert!(
            !ptr.is_null(),
            "must be called from within a multitask runtime thread"
        );
        // Safety: see `with_current`
        unsafe { (*ptr).exit() }
    }

    pub(crate) fn is_runtime_thread() -> bool {
        !CURRENT.get().is_null()
    }

    /// The task currently running on this thread.
    pub(crate) fn current_task(&self) -> TaskRef {
        self.current
            .get()
            .expect("no task is running on this scheduler")
    }

    /// Registers a freshly created task and marks it runnable.
    pub(crate) fn spawn(&self, task: TaskRef) {
        self.ntasks.set(self.ntasks.get() + 1);
        tracing::trace!(task.tid = %task.id(), "spawn");
        // We are the consumer, so the queue can't be parked.
        let parked = self.run_queue.enqueue(task.header());
        debug_assert!(!parked);
    }

    /// Appends a task to this scheduler's ready queue from any thread.
    ///
    /// Returns `true` if the owning thread was asleep and had to be woken.
    pub(crate) fn ready(&self, task: TaskRef) -> bool {
        let parked = self.run_queue.enqueue(task.header());
        if parked {
            self.sem.post();
        }
        parked
    }

    /// Takes the current task out of scheduling control.
    ///
    /// Until it is handed back through [`TaskRef::wake`] or
    /// [`Self::undequeue`], the next reschedule will not put it back on the
    /// ready queue.
    ///
    /// # Panics
    ///
    /// Panics if the current task already dequeued itself.
    pub(crate) fn dequeue(&self) -> TaskRef {
        assert!(!self.popped.get(), "task dequeued twice");
        self.popped.set(true);
        self.current_task()
    }

    /// Aborts a [`Self::dequeue`].
    pub(crate) fn undequeue(&self) {
        debug_assert!(self.popped.get(), "undequeue without dequeue");
        self.popped.set(false);
    }

    /// Switches to the next runnable task.
    ///
    /// Returns the number of switches that other tasks performed on this
    /// thread before the caller got resumed, 0 if there was nothing else to
    /// run.
    pub(crate) fn yield_now(&self) -> usize {
        let before = self.switches.get();
        self.reschedule();
        self.switches.get().wrapping_sub(before).saturating_sub(1)
    }

    /// Ends the current task.
    pub(crate) fn exit(&self) -> ! {
        let cur = self.current_task();
        cur.mark_dead();
        let remaining = self.ntasks.get() - 1;
        self.ntasks.set(remaining);
        tracing::trace!(task.tid = %cur.id(), remaining, "exit");

        if remaining == 0 {
            // Nothing can wake a task on this thread anymore. Queue ourselves
            // up for reaping and return to the thread's own stack.
            let parked = self.run_queue.enqueue(cur.header());
            debug_assert!(!parked);
            self.current.set(None);
            cur.exit_span();

            // Safety: the root context was saved by `run`, which is still
            // waiting on the OS stack for exactly this switch.
            unsafe { multitask_context::switch(cur.context(), self.root.get()) };
        } else {
            self.reschedule();
        }

        unreachable!("dead task was resumed");
    }

    /// Runs `first` and every task it spawns until all of them exited.
    ///
    /// Returns the first panic raised by any of the tasks.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is already driving a scheduler.
    pub(crate) fn run(self: &Arc<Self>, first: TaskRef) -> Option<Panic> {
        assert!(
            !Self::is_runtime_thread(),
            "cannot start a runtime from within a runtime thread"
        );
        CURRENT.set(ptr::from_ref(self));
        tracing::debug!("runtime thread started");

        self.ntasks.set(self.ntasks.get() + 1);
        self.current.set(Some(first));
        self.switches.set(self.switches.get().wrapping_add(1));

        // Safety: `first` was never run, its context starts at the entry
        // trampoline.
        unsafe { multitask_context::switch(self.root.get(), first.context()) };

        CURRENT.set(ptr::null());
        self.drain();
        tracing::debug!("runtime thread finished");

        self.panic.take()
    }

    /// Keeps the first panic raised by a task on this thread.
    pub(crate) fn record_panic(&self, payload: Panic) {
        let prev = self.panic.take();
        self.panic.set(prev.or(Some(payload)));
    }

    fn reschedule(&self) {
        let cur = self.current_task();
        let Some(next) = self.next_task(cur) else {
            return;
        };
        if next == cur {
            return;
        }

        self.current.set(Some(next));
        self.switches.set(self.switches.get().wrapping_add(1));
        cur.exit_span();

        // Safety: `cur` is the running task, so its context slot is free to
        // be written. `next` was dequeued from the ready queue, which means
        // it is suspended and owned by this thread.
        unsafe { multitask_context::switch(cur.context(), next.context()) };

        cur.enter_span();
    }

    /// Picks the task to run after `cur`.
    ///
    /// Returns `None` if `cur` should simply keep running. Blocks the whole
    /// thread if `cur` can't continue and nothing else is runnable.
    fn next_task(&self, cur: TaskRef) -> Option<TaskRef> {
        let mut backoff = Backoff::new();

        loop {
            let alive = !cur.is_dead() && !self.popped.get();
            if alive && self.ntasks.get() == 1 {
                return None;
            }

            // Safety: only the owning thread dequeues
            match unsafe { self.run_queue.try_dequeue() } {
                Ok(node) => {
                    let task = TaskRef::from_header(node);
                    if task.is_dead() {
                        // Safety: dead tasks are only queued after they
                        // switched away for the last time.
                        unsafe { self.reap(task) };
                        continue;
                    }

                    if !self.popped.get() || cur.is_dead() {
                        let parked = self.run_queue.enqueue(cur.header());
                        debug_assert!(!parked);
                    }
                    self.popped.set(false);
                    return Some(task);
                }
                Err(TryDequeueError::Inconsistent) => backoff.spin(),
                Err(TryDequeueError::Empty) if alive => return None,
                Err(TryDequeueError::Empty) => {
                    // Safety: only the owning thread parks
                    if unsafe { self.run_queue.try_park() } {
                        tracing::trace!("no runnable tasks, parking thread");
                        self.sem.wait();
                        backoff.reset();
                    }
                }
            }
        }
    }

    /// Frees every task still sitting in the ready queue.
    fn drain(&self) {
        let mut backoff = Backoff::new();
        loop {
            // Safety: only the owning thread dequeues
            match unsafe { self.run_queue.try_dequeue() } {
                Ok(node) => {
                    let task = TaskRef::from_header(node);
                    debug_assert!(task.is_dead(), "live task left behind");
                    // Safety: all tasks have exited
                    unsafe { self.reap(task) };
                }
                Err(TryDequeueError::Inconsistent) => backoff.spin(),
                Err(TryDequeueError::Empty) => break,
            }
        }
    }

    /// # Safety
    ///
    /// `task` must be dead and must not be referenced anymore.
    unsafe fn reap(&self, task: TaskRef) {
        tracing::trace!(task.tid = %task.id(), "reap");
        // Safety: ensured by caller
        unsafe { task.free() };
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("run_queue", &self.run_queue)
            .field("ntasks", &self.ntasks.get())
            .field("popped", &self.popped.get())
            .field("switches", &self.switches.get())
            .finish_non_exhaustive()
    }
}
