// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::AtomicPtr;
use crate::work_line::WorkLine;
use core::cell::Cell;
use core::fmt;
use core::ptr::{self, NonNull};

/// The function invoked when a task is executed, with the index of the work
/// line it was popped from (`None` when run inline by an awaiter).
pub type TaskFn = unsafe fn(NonNull<Task>, Option<usize>);

/// An intrusive unit of work for the [`ThreadPool`][crate::ThreadPool].
///
/// Tasks are linked into exactly one work line while queued; `worker_data`
/// points at that work line and is null whenever the task is detached.
/// `prev_link` holds the address of whichever slot currently points at this
/// node (the line head or the previous node's `next`), which makes interior
/// unlinking O(1) without a head special case.
#[repr(C)]
pub struct Task {
    pub(crate) next: Cell<*mut Task>,
    pub(crate) prev_link: Cell<*const Cell<*mut Task>>,
    pub(crate) worker_data: AtomicPtr<WorkLine>,
    pub(crate) run: TaskFn,
}

// Safety: the link fields are only accessed under the owning work line's
// lock (or before the task is published to a pool), and `worker_data` is
// atomic.
unsafe impl Send for Task {}
// Safety: see above.
unsafe impl Sync for Task {}

// === impl Task ===

impl Task {
    pub fn new(run: TaskFn) -> Self {
        Self {
            next: Cell::new(ptr::null_mut()),
            prev_link: Cell::new(ptr::null()),
            worker_data: AtomicPtr::new(ptr::null_mut()),
            run,
        }
    }

    /// Invokes the task function.
    ///
    /// # Safety
    ///
    /// `task` must be detached from every work line, and the caller must
    /// guarantee it stays alive for the duration of the call.
    pub(crate) unsafe fn execute(task: NonNull<Task>, line_index: Option<usize>) {
        // Read the function pointer before calling it; the task function is
        // free to invalidate the node.
        // Safety: ensured by caller
        let run = unsafe { task.as_ref().run };
        // Safety: ensured by caller
        unsafe { run(task, line_index) }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("queued", &!self.worker_data.load(core::sync::atomic::Ordering::Relaxed).is_null())
            .finish_non_exhaustive()
    }
}
