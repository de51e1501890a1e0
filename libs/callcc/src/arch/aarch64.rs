// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! AArch64 (AAPCS64) implementation of the symmetric context switch.
//!
//! The switch record layout, ascending from the continuation stack pointer:
//!
//! ```text
//! 0x00  x19   0x08  x20
//! 0x10  x21   0x18  x22
//! 0x20  x23   0x28  x24
//! 0x30  x25   0x38  x26
//! 0x40  x27   0x48  x28
//! 0x50  x29   0x58  x30 (resume address, or the entry function)
//! 0x60  d8    0x68  d9
//! 0x70  d10   0x78  d11
//! 0x80  d12   0x88  d13
//! 0x90  d14   0x98  d15
//! ```
//!
//! Conveniently the AAPCS64 argument and result registers coincide (x0/x1
//! both for a 16-byte composite argument and for returning one), so no
//! register shuffling between the "fresh entry" and "resumed switch" cases
//! is needed.

use crate::stack::StackPointer;
use crate::{EntryFn, OnTopFn, Transfer};
use core::arch::naked_asm;
use core::ptr;

pub const STACK_ALIGNMENT: usize = 16;

const RECORD_SIZE: usize = 0xa0;

/// Prepares a fresh stack so that the first switch into it enters `entry`.
///
/// # Safety
///
/// `stack_end` must point into a writable region with at least `0xa0` bytes
/// below it.
pub unsafe fn init_stack(stack_end: StackPointer, entry: EntryFn) -> StackPointer {
    // Safety: ensured by caller
    unsafe {
        let sp = (stack_end.get() & !(STACK_ALIGNMENT - 1)) - RECORD_SIZE;
        ptr::write_bytes(sp as *mut u8, 0, RECORD_SIZE);

        // The restore sequence loads this slot into x30 and returns through
        // it; a fresh context returns straight into its entry function. The
        // zeroed x29 slot terminates the frame chain.
        ((sp + 0x58) as *mut usize).write(entry as usize);

        StackPointer::new_unchecked(sp)
    }
}

/// Suspends the current execution and resumes `to`, passing `data` along.
#[unsafe(naked)]
pub unsafe extern "C" fn switch(to: StackPointer, data: usize) -> Transfer {
    naked_asm! {
        // Save the callee-saved registers (including the low halves of the
        // SIMD registers, which the AAPCS requires to be preserved).
        "sub  sp, sp, #0xa0",
        "stp  x19, x20, [sp, #0x00]",
        "stp  x21, x22, [sp, #0x10]",
        "stp  x23, x24, [sp, #0x20]",
        "stp  x25, x26, [sp, #0x30]",
        "stp  x27, x28, [sp, #0x40]",
        "stp  x29, x30, [sp, #0x50]",
        "stp  d8,  d9,  [sp, #0x60]",
        "stp  d10, d11, [sp, #0x70]",
        "stp  d12, d13, [sp, #0x80]",
        "stp  d14, d15, [sp, #0x90]",
        // Hand over the current stack pointer as the continuation and
        // switch to the target stack.
        "mov  x2, sp",
        "mov  sp, x0",
        "ldp  x19, x20, [sp, #0x00]",
        "ldp  x21, x22, [sp, #0x10]",
        "ldp  x23, x24, [sp, #0x20]",
        "ldp  x25, x26, [sp, #0x30]",
        "ldp  x27, x28, [sp, #0x40]",
        "ldp  x29, x30, [sp, #0x50]",
        "ldp  d8,  d9,  [sp, #0x60]",
        "ldp  d10, d11, [sp, #0x70]",
        "ldp  d12, d13, [sp, #0x80]",
        "ldp  d14, d15, [sp, #0x90]",
        "add  sp, sp, #0xa0",
        // x0/x1 carry the transfer both into a fresh entry function and out
        // of a resumed switch; x1 still holds `data`.
        "mov  x0, x2",
        "ret",
    }
}

/// Like [`switch`], but runs `f` on the resumed stack before the resumed
/// code continues. The target must be suspended inside a switch.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_on_top(
    to: StackPointer,
    data: usize,
    f: OnTopFn,
) -> Transfer {
    naked_asm! {
        "sub  sp, sp, #0xa0",
        "stp  x19, x20, [sp, #0x00]",
        "stp  x21, x22, [sp, #0x10]",
        "stp  x23, x24, [sp, #0x20]",
        "stp  x25, x26, [sp, #0x30]",
        "stp  x27, x28, [sp, #0x40]",
        "stp  x29, x30, [sp, #0x50]",
        "stp  d8,  d9,  [sp, #0x60]",
        "stp  d10, d11, [sp, #0x70]",
        "stp  d12, d13, [sp, #0x80]",
        "stp  d14, d15, [sp, #0x90]",
        "mov  x3, sp",
        "mov  sp, x0",
        "ldp  x19, x20, [sp, #0x00]",
        "ldp  x21, x22, [sp, #0x10]",
        "ldp  x23, x24, [sp, #0x20]",
        "ldp  x25, x26, [sp, #0x30]",
        "ldp  x27, x28, [sp, #0x40]",
        // x30 is loaded with the target's resume address and left there: it
        // is the return address of `f`, so the transfer `f` returns in x0/x1
        // flows straight into the target's suspended switch.
        "ldp  x29, x30, [sp, #0x50]",
        "ldp  d8,  d9,  [sp, #0x60]",
        "ldp  d10, d11, [sp, #0x70]",
        "ldp  d12, d13, [sp, #0x80]",
        "ldp  d14, d15, [sp, #0x90]",
        "add  sp, sp, #0xa0",
        "mov  x0, x3",
        "br   x2",
    }
}
