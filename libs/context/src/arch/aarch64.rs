// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Context switching for AAPCS64.
//!
//! The switch frame is 176 bytes: x19-x28, the frame record (x29, x30),
//! d8-d15 and FPCR, in that order from the saved stack pointer upwards.

use crate::{Context, EntryFn};
use core::arch::naked_asm;

pub const STACK_ALIGNMENT: usize = 16;

const FRAME_SIZE: usize = 176;

/// Lays out a fresh frame at `top` so that the first `switch` into it lands
/// in [`trampoline`], which then calls `entry(arg)`.
///
/// # Safety
///
/// `top` must be the upper end of a writable region large enough for the
/// initial frame.
pub unsafe fn init_stack(top: usize, entry: EntryFn, arg: usize) -> usize {
    let sp = (top & !(STACK_ALIGNMENT - 1)) - FRAME_SIZE;
    let frame = sp as *mut usize;

    // Safety: ensured by caller
    unsafe {
        frame.write_bytes(0, FRAME_SIZE / size_of::<usize>());
        frame.write(arg); // x19
        frame.add(1).write(entry as usize); // x20
        frame.add(11).write(trampoline as unsafe extern "C" fn() as usize); // x30
    }

    sp
}

#[unsafe(naked)]
unsafe extern "C" fn trampoline() {
    naked_asm!(
        "mov x0, x19",
        "blr x20",
        // entry functions never return
        "brk #0x1",
    )
}

/// Saves the callee-saved state of the running context into `save` and
/// resumes the context stored in `resume`.
///
/// # Safety
///
/// `resume` must hold a context produced by [`init_stack`] or a previous
/// `switch` whose stack is still alive and not running anywhere else.
#[unsafe(naked)]
pub unsafe extern "C" fn switch(save: *mut Context, resume: *const Context) {
    naked_asm!(
        "sub sp, sp, #176",
        "stp x19, x20, [sp, #0]",
        "stp x21, x22, [sp, #16]",
        "stp x23, x24, [sp, #32]",
        "stp x25, x26, [sp, #48]",
        "stp x27, x28, [sp, #64]",
        "stp x29, x30, [sp, #80]",
        "stp d8, d9, [sp, #96]",
        "stp d10, d11, [sp, #112]",
        "stp d12, d13, [sp, #128]",
        "stp d14, d15, [sp, #144]",
        "mrs x9, fpcr",
        "str x9, [sp, #160]",
        "mov x9, sp",
        "str x9, [x0]",
        "ldr x9, [x1]",
        "mov sp, x9",
        "ldr x9, [sp, #160]",
        "msr fpcr, x9",
        "ldp x19, x20, [sp, #0]",
        "ldp x21, x22, [sp, #16]",
        "ldp x23, x24, [sp, #32]",
        "ldp x25, x26, [sp, #48]",
        "ldp x27, x28, [sp, #64]",
        "ldp x29, x30, [sp, #80]",
        "ldp d8, d9, [sp, #96]",
        "ldp d10, d11, [sp, #112]",
        "ldp d12, d13, [sp, #128]",
        "ldp d14, d15, [sp, #144]",
        "add sp, sp, #176",
        "ret",
    )
}
