// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cooperative tasks.
//!
//! A task is a closure running on its own stack. It keeps the CPU until it
//! reaches a suspension point: [`yield_now`], [`exit`], or the blocking path
//! of one of the runtime's synchronization primitives. Tasks stay on the
//! thread that spawned them for their whole life.

mod builder;
mod id;

pub use builder::Builder;
pub use id::Id;
pub use multitask_context::MIN_STACK_SIZE;

use crate::error::Error;
use crate::scheduler::{Header, Scheduler};
use crate::sync::rwlock::Access;
use core::any::{Any, TypeId};
use core::cell::UnsafeCell;
use core::fmt;
use core::panic::AssertUnwindSafe;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, Ordering};
use multitask_context::{Context, Stack};
use std::panic;
use std::sync::Arc;

/// Stack size used unless a [`Builder`] says otherwise.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Spawns `f` as a new task on the current runtime thread.
///
/// The task first runs once the caller reaches a suspension point.
///
/// # Errors
///
/// Returns [`Error::Alloc`] when the task's stack can't be mapped.
///
/// # Panics
///
/// Panics when called outside of a runtime thread.
pub fn spawn<F>(f: F) -> Result<Id, Error>
where
    F: FnOnce() + 'static,
{
    Builder::new().spawn(f)
}

/// Lets every other runnable task on this thread run once.
///
/// Returns how many other tasks got switched to before the caller resumed,
/// so `0` means nothing else was runnable and no switch took place.
///
/// # Panics
///
/// Panics when called outside of a runtime thread.
pub fn yield_now() -> usize {
    Scheduler::with_current(|s| s.yield_now())
}

/// Ends the current task.
///
/// Destructors of values on the task's stack do not run.
///
/// # Panics
///
/// Panics when called outside of a runtime thread.
pub fn exit() -> ! {
    Scheduler::exit_current()
}

/// Returns the [`Id`] of the running task.
///
/// # Panics
///
/// Panics when called outside of a runtime thread.
pub fn current_id() -> Id {
    current().id()
}

/// Returns the number of bytes left between the current stack pointer and
/// the guard page of the running task's stack.
///
/// # Panics
///
/// Panics when called outside of a runtime thread.
#[inline(never)]
pub fn stack_remaining() -> usize {
    let marker = 0_u8;
    let sp = (&raw const marker).addr();
    sp.saturating_sub(current().stack_limit())
}

pub(crate) fn current() -> TaskRef {
    Scheduler::with_current(|s| s.current_task())
}

/// Takes the current task out of scheduling control, see
/// [`Scheduler::dequeue`].
pub(crate) fn dequeue() -> TaskRef {
    Scheduler::with_current(|s| s.dequeue())
}

pub(crate) fn undequeue() {
    Scheduler::with_current(|s| s.undequeue());
}

/// Suspends a task that previously called [`dequeue`] until somebody calls
/// [`TaskRef::wake`] on it.
pub(crate) fn park() {
    Scheduler::with_current(|s| {
        s.yield_now();
    });
}

/// What a suspended task is waiting for.
///
/// Whichever primitive holds the parked task owns this and reads it back
/// when it hands the task over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Payload {
    None,
    /// Queued on a read/write lock.
    Access(Access),
    /// Parked in the rendezvous table. `slot` points at an `Option<T>` on
    /// the parked task's stack with `TypeId::of::<T>() == ty`.
    Rendez {
        tag: usize,
        slot: NonNull<()>,
        ty: TypeId,
    },
    /// Parked on a typed exchange whose element type is fixed by the
    /// primitive. Points at an `Option<T>` on the parked task's stack.
    Slot(NonNull<()>),
}

/// The task record.
///
/// Lives in its own allocation next to its stack and is freed by its
/// scheduler once the task is dead and switched away for the last time.
#[repr(C)]
pub(crate) struct Task {
    /// Must stay first, queues link tasks through it.
    header: Header,
    scheduler: Arc<Scheduler>,
    id: Id,
    name: Option<Box<str>>,
    span: tracing::Span,
    context: UnsafeCell<Context>,
    stack: Stack,
    entry: UnsafeCell<Option<Box<dyn FnOnce()>>>,
    payload: UnsafeCell<Payload>,
    dead: AtomicBool,
}

impl Task {
    pub(crate) fn new(
        scheduler: Arc<Scheduler>,
        builder: &Builder<'_>,
        entry: Box<dyn FnOnce()>,
    ) -> Result<TaskRef, Error> {
        let stack = Stack::new(builder.stack_size).map_err(Error::Alloc)?;
        let id = Id::next();
        let span = tracing::trace_span!(
            "task",
            task.tid = id.as_u64(),
            task.name = ?builder.name,
        );

        let task = Box::new(Task {
            header: Header::new(),
            scheduler,
            id,
            name: builder.name.map(Box::from),
            span,
            context: UnsafeCell::new(Context::empty()),
            stack,
            entry: UnsafeCell::new(Some(entry)),
            payload: UnsafeCell::new(Payload::None),
            dead: AtomicBool::new(false),
        });
        let ptr = NonNull::from(Box::leak(task));

        // Safety: the stack is owned by the task and freed together with it,
        // so it outlives the context. `start` reconstructs the pointer from
        // the exposed address.
        unsafe {
            let task = ptr.as_ref();
            *task.context.get() = Context::new(&task.stack, start, ptr.as_ptr().expose_provenance());
        }

        Ok(TaskRef(ptr))
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("stack", &self.stack)
            .field("dead", &self.dead.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A non-owning handle to a [`Task`].
///
/// Whoever holds a `TaskRef` to a parked task is responsible for eventually
/// waking it. Handles to dead tasks must not be used.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct TaskRef(NonNull<Task>);

// Safety: the fields touched through a `TaskRef` from other threads are
// either atomic, immutable, or handed over under the synchronization of the
// primitive that parked the task.
unsafe impl Send for TaskRef {}
// Safety: see above
unsafe impl Sync for TaskRef {}

// === impl TaskRef ===

impl TaskRef {
    pub(crate) fn from_header(header: NonNull<Header>) -> Self {
        Self(header.cast())
    }

    pub(crate) fn header(self) -> NonNull<Header> {
        self.0.cast()
    }

    pub(crate) fn as_ptr(self) -> *mut Task {
        self.0.as_ptr()
    }

    /// # Safety
    ///
    /// `ptr` must come from [`TaskRef::as_ptr`] of a live task.
    pub(crate) unsafe fn from_ptr(ptr: NonNull<Task>) -> Self {
        Self(ptr)
    }

    fn task(&self) -> &Task {
        // Safety: tasks stay allocated until their scheduler reaps them, and
        // handles are only used while the task is alive.
        unsafe { self.0.as_ref() }
    }

    pub(crate) fn id(self) -> Id {
        self.task().id
    }

    /// Makes the task runnable again. Callable from any thread.
    pub(crate) fn wake(self) {
        // The task may run and exit as soon as it is enqueued, so hold on to
        // its scheduler ourselves.
        let scheduler = self.task().scheduler.clone();
        tracing::trace!(task.tid = %self.id(), "wake");
        scheduler.ready(self);
    }

    /// # Safety
    ///
    /// The caller must own the parked task, see [`Payload`].
    pub(crate) unsafe fn payload(self) -> Payload {
        // Safety: ensured by caller
        unsafe { *self.task().payload.get() }
    }

    /// # Safety
    ///
    /// The caller must be the task itself, or own it while it is parked.
    pub(crate) unsafe fn set_payload(self, payload: Payload) {
        // Safety: ensured by caller
        unsafe { *self.task().payload.get() = payload };
    }

    pub(crate) fn is_dead(self) -> bool {
        self.task().dead.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dead(self) {
        self.task().dead.store(true, Ordering::Release);
    }

    pub(crate) fn context(self) -> *mut Context {
        self.task().context.get()
    }

    pub(crate) fn stack_limit(self) -> usize {
        self.task().stack.limit()
    }

    pub(crate) fn enter_span(self) {
        self.task()
            .span
            .with_subscriber(|(id, dispatch)| dispatch.enter(id));
    }

    pub(crate) fn exit_span(self) {
        self.task()
            .span
            .with_subscriber(|(id, dispatch)| dispatch.exit(id));
    }

    /// # Safety
    ///
    /// The task must be dead, switched away from for the last time, and not
    /// referenced by any queue.
    pub(crate) unsafe fn free(self) {
        // Safety: allocated through `Box::leak` in `Task::new`
        drop(unsafe { Box::from_raw(self.0.as_ptr()) });
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskRef").field(&self.0).finish()
    }
}

/// First frame of every task.
unsafe extern "C" fn start(arg: usize) -> ! {
    // Safety: `arg` is the exposed address of the task record, see `Task::new`
    let task = TaskRef(unsafe { NonNull::new_unchecked(ptr::with_exposed_provenance_mut(arg)) });
    task.enter_span();

    // Safety: only read here, on the first run of the task
    let entry = unsafe { (*task.task().entry.get()).take() };
    if let Some(entry) = entry
        && let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry))
    {
        tracing::error!(
            task.tid = %task.id(),
            panic = panic_message(&*payload),
            "task panicked"
        );
        Scheduler::with_current(|s| s.record_panic(payload));
    }

    exit()
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "Box<dyn Any>"
    }
}
