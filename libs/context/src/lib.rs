// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Execution contexts for cooperative tasks.
//!
//! This crate provides the two building blocks a cooperative scheduler needs
//! to run code on more than one stack per OS thread:
//!
//! - [`Stack`], a memory-mapped stack region with a guard page.
//! - [`Context`], the saved state of a suspended stack, together with
//!   [`switch`] which suspends the running context and resumes another one.
//!
//! Unlike a coroutine, a switch is symmetric: there is no parent/child link
//! between contexts and any suspended context may resume any other.

mod arch;
mod stack;

pub use stack::{MIN_STACK_SIZE, Stack};

/// The function a fresh [`Context`] starts executing.
///
/// It receives the `arg` passed to [`Context::new`] and must never return.
pub type EntryFn = unsafe extern "C" fn(arg: usize) -> !;

/// Saved execution state of a suspended context.
///
/// All callee-saved registers and the floating-point control state are
/// kept on the suspended stack, so a context is just a stack pointer.
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct Context {
    sp: usize,
}

impl Context {
    /// A context that does not refer to any stack yet.
    ///
    /// It is only valid as the `save` argument to [`switch`].
    pub const fn empty() -> Self {
        Self { sp: 0 }
    }

    /// Creates a context that, once switched to, calls `entry(arg)` at the
    /// top of `stack`.
    ///
    /// # Safety
    ///
    /// The caller must keep `stack` alive for as long as the returned
    /// context may be resumed, and must not resume it more than once
    /// before it suspends itself again.
    pub unsafe fn new(stack: &Stack, entry: EntryFn, arg: usize) -> Self {
        // Safety: `stack.top()` is the end of a writable mapping of at least
        // MIN_STACK_SIZE bytes.
        let sp = unsafe { arch::init_stack(stack.top(), entry, arg) };
        Self { sp }
    }

    /// Returns `true` if this context has never been saved or initialized.
    pub const fn is_empty(&self) -> bool {
        self.sp == 0
    }
}

/// Suspends the running context into `save` and resumes `resume`.
///
/// Returns once some other context switches back into `save`.
///
/// # Safety
///
/// - `save` must be valid for writes and stay valid until it is resumed.
/// - `resume` must hold a context created by [`Context::new`] or saved by a
///   previous call to `switch`, whose stack is alive and not currently
///   executing on any thread.
#[inline]
pub unsafe fn switch(save: *mut Context, resume: *const Context) {
    // Safety: ensured by caller
    unsafe { arch::switch(save, resume) }
}

#[inline]
unsafe fn push(sp: &mut usize, val: usize) {
    // Safety: ensured by caller
    unsafe {
        *sp -= size_of::<usize>();
        *(*sp as *mut usize) = val;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    thread_local! {
        static MAIN: Cell<*mut Context> = const { Cell::new(core::ptr::null_mut()) };
        static SIDE: Cell<*mut Context> = const { Cell::new(core::ptr::null_mut()) };
        static TRACE: Cell<u32> = const { Cell::new(0) };
    }

    unsafe extern "C" fn ping(arg: usize) -> ! {
        TRACE.set(TRACE.get() * 10 + u32::try_from(arg).unwrap());
        // Safety: both contexts are set up by the test below
        unsafe { switch(SIDE.get(), MAIN.get()) };
        TRACE.set(TRACE.get() * 10 + 3);
        // Safety: see above
        unsafe { switch(SIDE.get(), MAIN.get()) };
        unreachable!("resumed a finished context");
    }

    #[test]
    fn switch_back_and_forth() {
        let stack = Stack::new(MIN_STACK_SIZE).unwrap();
        let mut main = Context::empty();
        // Safety: `stack` outlives `side`
        let mut side = unsafe { Context::new(&stack, ping, 1) };
        MAIN.set(&raw mut main);
        SIDE.set(&raw mut side);

        // Safety: `side` was created above and is resumed once per suspension
        unsafe { switch(&raw mut main, &raw const side) };
        TRACE.set(TRACE.get() * 10 + 2);
        // Safety: see above
        unsafe { switch(&raw mut main, &raw const side) };

        assert_eq!(TRACE.get(), 123);
    }

    #[test]
    fn float_state_survives_switch() {
        thread_local! {
            static OUT: Cell<f64> = const { Cell::new(0.0) };
        }

        unsafe extern "C" fn compute(arg: usize) -> ! {
            let x = f64::from(u32::try_from(arg).unwrap());
            OUT.set(x.sqrt() * 1.5);
            // Safety: both contexts are set up by the test below
            unsafe { switch(SIDE.get(), MAIN.get()) };
            unreachable!();
        }

        let stack = Stack::new(MIN_STACK_SIZE).unwrap();
        let mut main = Context::empty();
        // Safety: `stack` outlives `side`
        let mut side = unsafe { Context::new(&stack, compute, 16) };
        MAIN.set(&raw mut main);
        SIDE.set(&raw mut side);

        let before = 2.0_f64.powi(10);
        // Safety: `side` was created above
        unsafe { switch(&raw mut main, &raw const side) };
        assert_eq!(before, 1024.0);
        assert_eq!(OUT.get(), 6.0);
    }
}
