// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-worker task queues.

use crate::loom::sync::atomic::Ordering;
use crate::task::Task;
use core::cell::Cell;
use core::ptr::{self, NonNull};
use parking_lot::Mutex;

/// One worker's queue of pending tasks: an intrusive doubly-linked list in
/// LIFO discipline, guarded by a single mutex.
///
/// The backwards direction is the `prev_link` slot-pointer trick (see
/// [`Task`]), so pushing, popping and extracting an interior node are all
/// O(1) and share one code path for the head and interior cases.
#[derive(Debug)]
pub(crate) struct WorkLine {
    head: Mutex<Head>,
}

struct Head(Cell<*mut Task>);

// Safety: the raw task pointers are only dereferenced under the mutex.
unsafe impl Send for Head {}

impl core::fmt::Debug for Head {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Head").field(&self.0.get()).finish()
    }
}

// === impl WorkLine ===

impl WorkLine {
    pub(crate) fn new() -> Self {
        Self {
            head: Mutex::new(Head(Cell::new(ptr::null_mut()))),
        }
    }

    /// Prepends `task` if the line lock can be taken without blocking.
    ///
    /// # Safety
    ///
    /// `task` must be detached and stay alive until it is popped or
    /// extracted again.
    pub(crate) unsafe fn try_push(&self, task: NonNull<Task>) -> bool {
        let Some(head) = self.head.try_lock() else {
            return false;
        };
        // Safety: ensured by caller
        unsafe { self.push_front(&head, task) };
        true
    }

    /// Blocking variant of [`WorkLine::try_push`].
    ///
    /// # Safety
    ///
    /// See [`WorkLine::try_push`].
    pub(crate) unsafe fn push(&self, task: NonNull<Task>) {
        let head = self.head.lock();
        // Safety: ensured by caller
        unsafe { self.push_front(&head, task) };
    }

    /// Pops the most recently pushed task, or `None` if the line is empty
    /// or its lock is contended.
    pub(crate) fn try_pop(&self) -> Option<NonNull<Task>> {
        let head = self.head.try_lock()?;
        debug_assert!(self.audit(&head));

        let first = NonNull::new(head.0.get())?;
        // Safety: every task in the line is alive by the push contract.
        let task = unsafe { first.as_ref() };

        let next = task.next.get();
        head.0.set(next);
        if let Some(next) = NonNull::new(next) {
            // Safety: list node, alive by the push contract.
            unsafe { next.as_ref() }.prev_link.set(&head.0);
        }

        task.prev_link.set(ptr::null());
        task.worker_data.store(ptr::null_mut(), Ordering::Relaxed);

        debug_assert!(self.audit(&head));
        Some(first)
    }

    /// Unlinks `task` if it is still queued on this line.
    ///
    /// # Safety
    ///
    /// `task` must be alive.
    pub(crate) unsafe fn extract(&self, task: NonNull<Task>) -> bool {
        let head = self.head.lock();
        debug_assert!(self.audit(&head));

        // Safety: ensured by caller
        let task = unsafe { task.as_ref() };

        // The task may have been popped between the caller's lock-free check
        // and us taking the lock.
        if !ptr::eq(task.worker_data.load(Ordering::Relaxed), self) {
            return false;
        }

        let prev_link = task.prev_link.get();
        debug_assert!(!prev_link.is_null());
        // Safety: `prev_link` points at the slot that points at `task`,
        // either the head or a live predecessor's `next`.
        unsafe { (*prev_link).set(task.next.get()) };
        if let Some(next) = NonNull::new(task.next.get()) {
            // Safety: list node, alive by the push contract.
            unsafe { next.as_ref() }.prev_link.set(prev_link);
        }

        task.worker_data.store(ptr::null_mut(), Ordering::Relaxed);
        task.prev_link.set(ptr::null());

        debug_assert!(self.audit(&head));
        true
    }

    /// # Safety
    ///
    /// Caller holds the lock, `task` is detached and alive.
    unsafe fn push_front(&self, head: &Head, task: NonNull<Task>) {
        debug_assert!(self.audit(head));
        // Safety: ensured by caller
        let task_ref = unsafe { task.as_ref() };

        task_ref
            .worker_data
            .store(ptr::from_ref(self).cast_mut(), Ordering::Relaxed);

        let old = head.0.get();
        task_ref.next.set(old);
        if let Some(old) = NonNull::new(old) {
            // Safety: list node, alive by the push contract.
            unsafe { old.as_ref() }.prev_link.set(&task_ref.next);
        }
        task_ref.prev_link.set(&head.0);
        head.0.set(task.as_ptr());

        debug_assert!(self.audit(head));
    }

    /// Walks the chain checking that every `prev_link` dereferences to the
    /// slot holding the node and that all back-pointers name this line.
    /// Only invoked through `debug_assert!`.
    fn audit(&self, head: &Head) -> bool {
        let mut prev_slot: *const Cell<*mut Task> = &head.0;
        let mut cur = head.0.get();
        while let Some(node) = NonNull::new(cur) {
            // Safety: list node, alive by the push contract.
            let node = unsafe { node.as_ref() };
            assert_eq!(node.prev_link.get(), prev_slot);
            assert!(ptr::eq(node.worker_data.load(Ordering::Relaxed), self));
            prev_slot = &node.next;
            cur = node.next.get();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn nop(_task: NonNull<Task>, _line: Option<usize>) {}

    #[test]
    fn push_pop_is_lifo() {
        let line = WorkLine::new();
        let a = Task::new(nop);
        let b = Task::new(nop);
        let c = Task::new(nop);

        // Safety: the tasks outlive the line operations below.
        unsafe {
            assert!(line.try_push(NonNull::from(&a)));
            line.push(NonNull::from(&b));
            assert!(line.try_push(NonNull::from(&c)));
        }

        assert_eq!(line.try_pop(), Some(NonNull::from(&c)));
        assert_eq!(line.try_pop(), Some(NonNull::from(&b)));
        assert_eq!(line.try_pop(), Some(NonNull::from(&a)));
        assert_eq!(line.try_pop(), None);
    }

    #[test]
    fn pop_clears_back_pointers() {
        let line = WorkLine::new();
        let a = Task::new(nop);

        // Safety: `a` outlives the line operations below.
        unsafe { line.push(NonNull::from(&a)) };
        let popped = line.try_pop().unwrap();

        // Safety: `popped` is `a`.
        let task = unsafe { popped.as_ref() };
        assert!(task.worker_data.load(Ordering::Relaxed).is_null());
        assert!(task.prev_link.get().is_null());
    }

    #[test]
    fn extract_interior_node() {
        let line = WorkLine::new();
        let a = Task::new(nop);
        let b = Task::new(nop);
        let c = Task::new(nop);

        // Safety: the tasks outlive the line operations below.
        unsafe {
            line.push(NonNull::from(&a));
            line.push(NonNull::from(&b));
            line.push(NonNull::from(&c));

            // `b` is an interior node; unlinking must not disturb the rest.
            assert!(line.extract(NonNull::from(&b)));
            assert!(!line.extract(NonNull::from(&b)));
        }

        assert_eq!(line.try_pop(), Some(NonNull::from(&c)));
        assert_eq!(line.try_pop(), Some(NonNull::from(&a)));
        assert_eq!(line.try_pop(), None);
    }

    #[test]
    fn extract_head_and_tail() {
        let line = WorkLine::new();
        let a = Task::new(nop);
        let b = Task::new(nop);

        // Safety: the tasks outlive the line operations below.
        unsafe {
            line.push(NonNull::from(&a));
            line.push(NonNull::from(&b));

            assert!(line.extract(NonNull::from(&b)));
            assert!(line.extract(NonNull::from(&a)));
        }

        assert_eq!(line.try_pop(), None);
    }

    #[test]
    fn extract_detached_fails() {
        let line = WorkLine::new();
        let a = Task::new(nop);

        // Safety: `a` outlives the line operations below.
        assert!(!unsafe { line.extract(NonNull::from(&a)) });
    }
}
