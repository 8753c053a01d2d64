// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Context switching for the System V x86_64 ABI.
//!
//! A suspended context is a single stack pointer. Everything else lives on
//! the suspended stack, laid out (from high to low addresses) as:
//!
//! ```text
//! +--------------------+
//! | return address     | <- where `switch` returns to on resume
//! | rbp                |
//! | rbx                |
//! | r12                |
//! | r13                |
//! | r14                |
//! | r15                |
//! | mxcsr | x87 cw     | <- saved stack pointer
//! +--------------------+
//! ```

use crate::{Context, EntryFn, push};
use core::arch::naked_asm;

pub const STACK_ALIGNMENT: usize = 16;

/// MXCSR with all exceptions masked and round-to-nearest in the low half,
/// the default x87 control word in the high half.
const INITIAL_FP_CONTROL: usize = 0x1F80 | (0x037F << 32);

/// Lays out a fresh frame at `top` so that the first `switch` into it lands
/// in [`trampoline`], which then calls `entry(arg)`.
///
/// # Safety
///
/// `top` must be the upper end of a writable region large enough for the
/// initial frame.
pub unsafe fn init_stack(top: usize, entry: EntryFn, arg: usize) -> usize {
    let mut sp = top & !(STACK_ALIGNMENT - 1);

    // Safety: ensured by caller
    unsafe {
        push(&mut sp, trampoline as unsafe extern "C" fn() as usize);
        push(&mut sp, 0); // rbp, terminates the frame pointer chain
        push(&mut sp, 0); // rbx
        push(&mut sp, arg); // r12
        push(&mut sp, entry as usize); // r13
        push(&mut sp, 0); // r14
        push(&mut sp, 0); // r15
        push(&mut sp, INITIAL_FP_CONTROL);
    }

    sp
}

/// Entered through the `ret` of the first switch into a new context.
///
/// The stack pointer is 16-byte aligned here, so `call` leaves the callee
/// with the alignment the ABI expects at function entry.
#[unsafe(naked)]
unsafe extern "C" fn trampoline() {
    naked_asm!(
        "mov rdi, r12",
        "call r13",
        // entry functions never return
        "ud2",
    )
}

/// Saves the callee-saved state of the running context into `save` and
/// resumes the context stored in `resume`.
///
/// `resume` is read after `save` is written, so switching a context onto
/// itself returns immediately.
///
/// # Safety
///
/// `resume` must hold a context produced by [`init_stack`] or a previous
/// `switch` whose stack is still alive and not running anywhere else.
#[unsafe(naked)]
pub unsafe extern "C" fn switch(save: *mut Context, resume: *const Context) {
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "sub rsp, 8",
        "stmxcsr dword ptr [rsp]",
        "fnstcw word ptr [rsp + 4]",
        "mov [rdi], rsp",
        "mov rsp, [rsi]",
        "ldmxcsr dword ptr [rsp]",
        "fldcw word ptr [rsp + 4]",
        "add rsp, 8",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    )
}
