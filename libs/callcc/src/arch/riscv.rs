// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! RISC-V (RV64GC) implementation of the symmetric context switch.
//!
//! The switch record layout, ascending from the continuation stack pointer:
//!
//! ```text
//! 0x00  s0    0x08  s1
//! 0x10  s2    0x18  s3
//! 0x20  s4    0x28  s5
//! 0x30  s6    0x38  s7
//! 0x40  s8    0x48  s9
//! 0x50  s10   0x58  s11
//! 0x60  ra (resume address, or the entry function)
//! 0x68  fs0   0x70  fs1
//! 0x78  fs2   0x80  fs3
//! 0x88  fs4   0x90  fs5
//! 0x98  fs6   0xa0  fs7
//! 0xa8  fs8   0xb0  fs9
//! 0xb8  fs10  0xc0  fs11
//! ```
//!
//! Like on AArch64 the argument and result registers coincide (a0/a1), so
//! fresh entries and resumed switches share the restore path unmodified.

#[cfg(target_arch = "riscv32")]
compile_error!("only riscv64 is supported");

use crate::stack::StackPointer;
use crate::{EntryFn, OnTopFn, Transfer};
use core::arch::naked_asm;
use core::ptr;

pub const STACK_ALIGNMENT: usize = 16;

/// Size of the switch record, rounded up to the mandated stack alignment.
const RECORD_SIZE: usize = 0xd0;

/// Prepares a fresh stack so that the first switch into it enters `entry`.
///
/// # Safety
///
/// `stack_end` must point into a writable region with at least `0xd0` bytes
/// below it.
pub unsafe fn init_stack(stack_end: StackPointer, entry: EntryFn) -> StackPointer {
    // Safety: ensured by caller
    unsafe {
        let sp = (stack_end.get() & !(STACK_ALIGNMENT - 1)) - RECORD_SIZE;
        ptr::write_bytes(sp as *mut u8, 0, RECORD_SIZE);

        // The restore sequence loads this slot into ra and returns through
        // it; a fresh context returns straight into its entry function.
        ((sp + 0x60) as *mut usize).write(entry as usize);

        StackPointer::new_unchecked(sp)
    }
}

/// Suspends the current execution and resumes `to`, passing `data` along.
#[unsafe(naked)]
pub unsafe extern "C" fn switch(to: StackPointer, data: usize) -> Transfer {
    naked_asm! {
        "addi sp, sp, -0xd0",
        "sd   s0,  0x00(sp)",
        "sd   s1,  0x08(sp)",
        "sd   s2,  0x10(sp)",
        "sd   s3,  0x18(sp)",
        "sd   s4,  0x20(sp)",
        "sd   s5,  0x28(sp)",
        "sd   s6,  0x30(sp)",
        "sd   s7,  0x38(sp)",
        "sd   s8,  0x40(sp)",
        "sd   s9,  0x48(sp)",
        "sd   s10, 0x50(sp)",
        "sd   s11, 0x58(sp)",
        "sd   ra,  0x60(sp)",
        "fsd  fs0,  0x68(sp)",
        "fsd  fs1,  0x70(sp)",
        "fsd  fs2,  0x78(sp)",
        "fsd  fs3,  0x80(sp)",
        "fsd  fs4,  0x88(sp)",
        "fsd  fs5,  0x90(sp)",
        "fsd  fs6,  0x98(sp)",
        "fsd  fs7,  0xa0(sp)",
        "fsd  fs8,  0xa8(sp)",
        "fsd  fs9,  0xb0(sp)",
        "fsd  fs10, 0xb8(sp)",
        "fsd  fs11, 0xc0(sp)",
        // Hand over the current stack pointer as the continuation and
        // switch to the target stack.
        "mv   t0, sp",
        "mv   sp, a0",
        "ld   s0,  0x00(sp)",
        "ld   s1,  0x08(sp)",
        "ld   s2,  0x10(sp)",
        "ld   s3,  0x18(sp)",
        "ld   s4,  0x20(sp)",
        "ld   s5,  0x28(sp)",
        "ld   s6,  0x30(sp)",
        "ld   s7,  0x38(sp)",
        "ld   s8,  0x40(sp)",
        "ld   s9,  0x48(sp)",
        "ld   s10, 0x50(sp)",
        "ld   s11, 0x58(sp)",
        "ld   ra,  0x60(sp)",
        "fld  fs0,  0x68(sp)",
        "fld  fs1,  0x70(sp)",
        "fld  fs2,  0x78(sp)",
        "fld  fs3,  0x80(sp)",
        "fld  fs4,  0x88(sp)",
        "fld  fs5,  0x90(sp)",
        "fld  fs6,  0x98(sp)",
        "fld  fs7,  0xa0(sp)",
        "fld  fs8,  0xa8(sp)",
        "fld  fs9,  0xb0(sp)",
        "fld  fs10, 0xb8(sp)",
        "fld  fs11, 0xc0(sp)",
        "addi sp, sp, 0xd0",
        // a0/a1 carry the transfer both into a fresh entry function and out
        // of a resumed switch; a1 still holds `data`.
        "mv   a0, t0",
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
        "addi sp, sp, -0xd0",
        "sd   s0,  0x00(sp)",
        "sd   s1,  0x08(sp)",
        "sd   s2,  0x10(sp)",
        "sd   s3,  0x18(sp)",
        "sd   s4,  0x20(sp)",
        "sd   s5,  0x28(sp)",
        "sd   s6,  0x30(sp)",
        "sd   s7,  0x38(sp)",
        "sd   s8,  0x40(sp)",
        "sd   s9,  0x48(sp)",
        "sd   s10, 0x50(sp)",
        "sd   s11, 0x58(sp)",
        "sd   ra,  0x60(sp)",
        "fsd  fs0,  0x68(sp)",
        "fsd  fs1,  0x70(sp)",
        "fsd  fs2,  0x78(sp)",
        "fsd  fs3,  0x80(sp)",
        "fsd  fs4,  0x88(sp)",
        "fsd  fs5,  0x90(sp)",
        "fsd  fs6,  0x98(sp)",
        "fsd  fs7,  0xa0(sp)",
        "fsd  fs8,  0xa8(sp)",
        "fsd  fs9,  0xb0(sp)",
        "fsd  fs10, 0xb8(sp)",
        "fsd  fs11, 0xc0(sp)",
        "mv   t0, sp",
        "mv   sp, a0",
        // Stash the on-top function before a0 is rewritten below.
        "mv   t1, a2",
        "ld   s0,  0x00(sp)",
        "ld   s1,  0x08(sp)",
        "ld   s2,  0x10(sp)",
        "ld   s3,  0x18(sp)",
        "ld   s4,  0x20(sp)",
        "ld   s5,  0x28(sp)",
        "ld   s6,  0x30(sp)",
        "ld   s7,  0x38(sp)",
        "ld   s8,  0x40(sp)",
        "ld   s9,  0x48(sp)",
        "ld   s10, 0x50(sp)",
        "ld   s11, 0x58(sp)",
        // ra is loaded with the target's resume address and left there: it
        // is the return address of `f`, so the transfer `f` returns in a0/a1
        // flows straight into the target's suspended switch.
        "ld   ra,  0x60(sp)",
        "fld  fs0,  0x68(sp)",
        "fld  fs1,  0x70(sp)",
        "fld  fs2,  0x78(sp)",
        "fld  fs3,  0x80(sp)",
        "fld  fs4,  0x88(sp)",
        "fld  fs5,  0x90(sp)",
        "fld  fs6,  0x98(sp)",
        "fld  fs7,  0xa0(sp)",
        "fld  fs8,  0xa8(sp)",
        "fld  fs9,  0xb0(sp)",
        "fld  fs10, 0xb8(sp)",
        "fld  fs11, 0xc0(sp)",
        "addi sp, sp, 0xd0",
        "mv   a0, t0",
        "jr   t1",
    }
}
