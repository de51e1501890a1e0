// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::stack::{MIN_STACK_SIZE, Stack, StackAllocator};
use std::io::Error;
use std::num::NonZeroUsize;
use std::ptr;

/// Allocates stacks with `mmap`, with one guard page at the low end.
#[derive(Debug, Clone)]
pub struct MmapStackAllocator {
    stack_size: usize,
}

// === impl MmapStackAllocator ===

impl MmapStackAllocator {
    /// An allocator handing out stacks with at least `stack_size` usable
    /// bytes.
    pub fn new(stack_size: usize) -> Self {
        Self {
            stack_size: stack_size.max(MIN_STACK_SIZE),
        }
    }

    /// Fallible variant of [`StackAllocator::allocate`].
    pub fn try_allocate(&mut self) -> std::io::Result<Stack> {
        let size = self.stack_size;

        // Add a guard page to the requested size and round the size up to
        // a page boundary.
        let page_size = page_size();
        let mmap_len = size
            .checked_add(page_size + page_size - 1)
            .expect("integer overflow while calculating stack size")
            & !(page_size - 1);

        // OpenBSD requires MAP_STACK on anything that is used as a stack.
        cfg_if::cfg_if! {
            if #[cfg(target_os = "openbsd")] {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
            } else {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
            }
        }

        // Safety: anonymous mapping, no aliasing concerns.
        unsafe {
            // Reserve address space for the stack.
            let mmap = libc::mmap(ptr::null_mut(), mmap_len, libc::PROT_NONE, map_flags, -1, 0);
            if mmap == libc::MAP_FAILED {
                return Err(Error::last_os_error());
            }

            // Make everything except the guard page writable.
            if libc::mprotect(
                mmap.cast::<u8>().add(page_size).cast(),
                mmap_len - page_size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                let err = Error::last_os_error();
                libc::munmap(mmap, mmap_len);
                return Err(err);
            }

            let top = NonZeroUsize::new(mmap as usize + mmap_len).unwrap();
            Ok(Stack::from_raw_parts(top, mmap_len))
        }
    }
}

impl Default for MmapStackAllocator {
    fn default() -> Self {
        Self::new(crate::stack::DEFAULT_STACK_SIZE)
    }
}

impl StackAllocator for MmapStackAllocator {
    fn allocate(&mut self) -> Stack {
        self.try_allocate().expect("failed to allocate stack")
    }

    unsafe fn deallocate(&mut self, stack: Stack) {
        let base = stack.top().get() - stack.len();
        // Safety: `stack` describes a mapping produced by `try_allocate`.
        unsafe {
            let ret = libc::munmap(base as *mut _, stack.len());
            debug_assert_eq!(ret, 0);
        }
    }
}

fn page_size() -> usize {
    // Safety: sysconf is always safe to call.
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    assert!(pagesize.is_power_of_two());
    pagesize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_is_usable() {
        let mut allocator = MmapStackAllocator::new(MIN_STACK_SIZE);
        let stack = allocator.allocate();

        assert_eq!(stack.top().get() % crate::stack::STACK_ALIGNMENT, 0);
        assert!(stack.len() >= MIN_STACK_SIZE);

        // The top of the region must be writable (the control record goes
        // there), the bottom page must not (guard).
        // Safety: the byte below `top` is inside the writable mapping.
        unsafe {
            let probe = (stack.top().get() - 1) as *mut u8;
            probe.write(0xaa);
            assert_eq!(probe.read(), 0xaa);
        }

        // Safety: nothing is running on the stack.
        unsafe { allocator.deallocate(stack) };
    }
}
