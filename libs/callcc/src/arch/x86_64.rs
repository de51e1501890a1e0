// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! x86_64 System V implementation of the symmetric context switch.
//!
//! A continuation is the stack pointer of a *switch record* saved on the
//! suspended stack. The record holds the callee-saved registers plus the
//! resume address, laid out as follows (ascending from the continuation
//! stack pointer):
//!
//! ```text
//! 0x00  r12
//! 0x08  r13
//! 0x10  r14
//! 0x18  r15
//! 0x20  rbx
//! 0x28  rbp
//! 0x30  rip (resume address, or the entry function for a fresh context)
//! ```
//!
//! All other registers are in caller-saved space of `switch`'s caller, so
//! the compiler takes care of them for us.

use crate::stack::StackPointer;
use crate::{EntryFn, OnTopFn, Transfer};
use core::arch::naked_asm;
use core::ptr;

pub const STACK_ALIGNMENT: usize = 16;

/// Size of the switch record.
const RECORD_SIZE: usize = 0x38;

/// Prepares a fresh stack so that the first switch into it enters `entry`.
///
/// # Safety
///
/// `stack_end` must point into a writable region with at least `0x40` bytes
/// below it.
pub unsafe fn init_stack(stack_end: StackPointer, entry: EntryFn) -> StackPointer {
    // Safety: ensured by caller
    unsafe {
        // Reserve the record plus one slot of padding so that the entry
        // function observes the stack alignment of a regular call.
        let sp = (stack_end.get() & !(STACK_ALIGNMENT - 1)) - RECORD_SIZE - 8;
        ptr::write_bytes(sp as *mut u8, 0, RECORD_SIZE + 8);

        // The restore sequence pops this slot into the jump target; a fresh
        // context jumps straight into its entry function. The zeroed slot
        // above it doubles as a frame chain terminator.
        ((sp + 0x30) as *mut usize).write(entry as usize);

        StackPointer::new_unchecked(sp)
    }
}

/// Suspends the current execution and resumes `to`, passing `data` along.
///
/// Returns when the suspended execution is resumed; the transfer carries the
/// continuation of whoever resumed us.
#[unsafe(naked)]
pub unsafe extern "C" fn switch(to: StackPointer, data: usize) -> Transfer {
    naked_asm! {
        // Save the callee-saved registers on top of the return address that
        // the CALL into this function pushed; together they form the switch
        // record described in the module docs.
        "push rbp",
        "push rbx",
        "push r15",
        "push r14",
        "push r13",
        "push r12",
        // The current stack pointer is the continuation we hand over.
        "mov rax, rsp",
        // Switch to the target stack.
        "mov rsp, rdi",
        // Restore the target's callee-saved registers. For a fresh context
        // these are the zeros written by init_stack().
        "pop r12",
        "pop r13",
        "pop r14",
        "pop r15",
        "pop rbx",
        "pop rbp",
        // Pop the resume address (or the entry function).
        "pop r8",
        // A resumed switch returns the transfer in RAX:RDX, a fresh entry
        // function receives it as an argument in RDI:RSI. Populate both
        // register pairs; RAX already holds the suspended continuation and
        // RSI still holds `data`.
        "mov rdi, rax",
        "mov rdx, rsi",
        "jmp r8",
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
        // Same record as switch().
        "push rbp",
        "push rbx",
        "push r15",
        "push r14",
        "push r13",
        "push r12",
        "mov rax, rsp",
        "mov rsp, rdi",
        // Stash the on-top function before the argument registers are
        // rewritten below.
        "mov rcx, rdx",
        "pop r12",
        "pop r13",
        "pop r14",
        "pop r15",
        "pop rbx",
        "pop rbp",
        // The resume address is deliberately left on the stack: it becomes
        // the return address of `f`, so the transfer `f` returns in RAX:RDX
        // flows straight into the target's suspended switch.
        "mov rdi, rax",
        "jmp rcx",
    }
}
