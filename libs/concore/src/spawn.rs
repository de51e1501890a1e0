// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Spawning work and awaiting it with thread inversion.
//!
//! [`spawn`] queues a closure on the [global pool][crate::global_thread_pool]
//! and returns a future whose [`join`][SpawnFuture::join] produces the
//! closure's value. The interesting part is what happens when `join` is
//! called before the closure has finished: instead of blocking, the calling
//! flow parks its continuation in the spawn frame and the calling OS thread
//! takes over the worker's scheduling loop. When the closure completes, the
//! worker's OS thread picks the parked continuation back up. Both logical
//! flows keep running at all times; only the mapping of flows to OS threads
//! changes. This is *thread inversion*.
//!
//! The rendezvous is decided by one `swap` on the frame's `sync_state`:
//!
//! ```text
//!                 initial
//!                /       \
//!     join() first        worker finishes first
//!               |          |
//!        main_finished    async_finished
//!   (worker will jump to  (join() returns on the
//!    the parked flow)      calling thread)
//! ```
//!
//! Whoever loses the swap finds the winner's continuation in the frame and
//! jumps to it; the release/acquire pair on the swap also publishes the
//! result slot.

use crate::loom::sync::Arc;
use crate::loom::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use crate::task::Task;
use crate::thread_pool::global_thread_pool;
use callcc::{Continuation, callcc};
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::num::NonZeroUsize;
use core::ptr::NonNull;
use crossbeam_utils::Backoff;
use std::panic::{self, AssertUnwindSafe};

/// Neither party has reached the rendezvous.
const INITIAL: u32 = 0;
/// The spawner reached `join` first and parked its continuation.
const MAIN_FINISHED: u32 = 1;
/// The worker finished the user function first.
const ASYNC_FINISHED: u32 = 2;

/// A continuation parked in a spawn frame. Zero when empty.
struct SuspensionSlot(AtomicUsize);

// === impl SuspensionSlot ===

impl SuspensionSlot {
    fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    fn store_relaxed(&self, cont: Continuation) {
        self.0.store(cont.into_raw().get(), Ordering::Relaxed);
    }

    fn store_release(&self, cont: NonZeroUsize) {
        self.0.store(cont.get(), Ordering::Release);
    }

    fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire) != 0
    }

    /// # Safety
    ///
    /// The slot must hold a continuation that nobody else will take.
    unsafe fn take(&self, ordering: Ordering) -> Continuation {
        let raw = self.0.swap(0, ordering);
        debug_assert_ne!(raw, 0);
        // Safety: non-zero values only enter the slot via `into_raw`, and
        // the state machine hands each continuation to exactly one taker.
        unsafe { Continuation::from_raw(NonZeroUsize::new_unchecked(raw)) }
    }
}

/// The untyped core of a spawn operation. Address-stable from `spawn` until
/// the result has been collected.
#[repr(C)]
pub(crate) struct FrameBase {
    /// Embedded queue node; must stay the first field so task and frame
    /// pointers coincide.
    task: Task,
    /// The rendezvous state, see the module docs.
    sync_state: AtomicU32,
    /// Parked continuation of the spawner, written under `join`.
    originator: SuspensionSlot,
    /// The worker's scheduling-loop continuation, written when the task
    /// starts executing.
    secondary: SuspensionSlot,
    /// Monomorphized adapter that runs the user closure and fills the
    /// result slot.
    user_function: unsafe fn(NonNull<FrameBase>),
    /// Whether a future has already collected (or committed to collect)
    /// the result.
    claimed: AtomicBool,
}

// === impl FrameBase ===

impl FrameBase {
    fn new(user_function: unsafe fn(NonNull<FrameBase>)) -> Self {
        Self {
            task: Task::new(execute_spawn_task),
            sync_state: AtomicU32::new(INITIAL),
            originator: SuspensionSlot::new(),
            secondary: SuspensionSlot::new(),
            user_function,
            claimed: AtomicBool::new(false),
        }
    }

    /// Completion protocol of the executing side. `thread_cont` is the
    /// continuation the executor would resume if it is free to go (the
    /// worker's scheduling loop, or the awaiter's frame for an inline run).
    fn on_async_complete(&self, thread_cont: NonZeroUsize) -> Continuation {
        match self.sync_state.swap(ASYNC_FINISHED, Ordering::AcqRel) {
            INITIAL => {
                // The spawner has not reached the rendezvous; nothing to
                // hand over, resume the scheduling loop.
                // Safety: `thread_cont` is this executor's suspended caller
                // and nobody else can take it (the spawner now observes
                // `async_finished` and stays on its own thread).
                unsafe { Continuation::from_raw(thread_cont) }
            }
            state => {
                debug_assert_eq!(state, MAIN_FINISHED);
                // The spawner is parked: thread inversion. Continue its flow
                // on this OS thread; our scheduling loop is already being
                // driven by the thread the spawner vacated.
                // Safety: `main_finished` guarantees the originator slot was
                // populated before the spawner's swap.
                unsafe { self.originator.take(Ordering::Acquire) }
            }
        }
    }

    /// Blocks (logically, never physically) until the computation has
    /// finished. Returns with the result slot populated, possibly on a
    /// different OS thread than it was called on.
    pub(crate) fn rendezvous(&self) {
        // Fast path: the worker already finished; the acquire pairs with
        // the completion swap and makes the result visible.
        if self.sync_state.load(Ordering::Acquire) == ASYNC_FINISHED {
            return;
        }

        // Has anybody started the task? If not, pull it back and run it
        // inline on this thread.
        let task = NonNull::from(&self.task);
        // Safety: `spawn` queued the task on the global pool and the frame
        // is alive for the duration of this call.
        if unsafe { global_thread_pool().extract_task(task) } {
            tracing::trace!("task not started, executing inline");
            // Safety: just detached; the frame is alive.
            unsafe { execute_spawn_task(task, None) };
            debug_assert_eq!(self.sync_state.load(Ordering::Relaxed), ASYNC_FINISHED);
            return;
        }

        // A worker owns the task but may still be setting up its stack;
        // wait until its scheduling-loop continuation is published so the
        // inversion below has somewhere to jump.
        let backoff = Backoff::new();
        while !self.secondary.is_set() {
            backoff.snooze();
        }

        let _ = callcc(|await_cc| {
            let raw = await_cc.into_raw();
            // The swap below publishes the slot to the worker.
            // Safety: `raw` round-trips through the slot unchanged.
            self.originator
                .store_relaxed(unsafe { Continuation::from_raw(raw) });

            match self.sync_state.swap(MAIN_FINISHED, Ordering::AcqRel) {
                INITIAL => {
                    // The worker is still going: thread inversion. This OS
                    // thread becomes the worker; the spawned flow resumes
                    // `await_cc` when it completes.
                    // Safety: the slot was published with release at task
                    // start and observed by the spin above.
                    unsafe { self.secondary.take(Ordering::Relaxed) }
                }
                state => {
                    debug_assert_eq!(state, ASYNC_FINISHED);
                    // The worker finished while we were parking; withdraw
                    // the parked continuation and continue right here.
                    // Safety: `async_finished` means the worker will never
                    // look at the originator slot.
                    unsafe { self.originator.take(Ordering::Relaxed) }
                }
            }
        });
        // Resumed: the rendezvous has linearized and the result is ours,
        // on whichever OS thread the inversion left us.
    }
}

/// Task function of every spawn frame; runs the user function on a fresh
/// stack so the surrounding scheduling loop can be resumed independently.
///
/// # Safety
///
/// `task` must be the embedded node of a live, detached [`FrameBase`].
pub(crate) unsafe fn execute_spawn_task(task: NonNull<Task>, _line_index: Option<usize>) {
    // The task node is the first field of the frame.
    let frame = task.cast::<FrameBase>();
    let _ = callcc(move |thread_cont| {
        // Safety: ensured by caller; the frame stays alive until the result
        // is collected, which cannot happen before `on_async_complete`.
        let base = unsafe { frame.as_ref() };

        let raw = thread_cont.into_raw();
        // Publish the scheduling-loop continuation before running the user
        // function; an awaiter that lost the extract race spins on this.
        base.secondary.store_release(raw);

        // Safety: called exactly once per frame.
        unsafe { (base.user_function)(frame) };

        base.on_async_complete(raw)
    });
}

/// The typed payload around a [`FrameBase`]: the user closure on the way
/// in, its result (or panic payload) on the way out.
#[repr(C)]
pub(crate) struct SpawnFrame<F, R> {
    base: FrameBase,
    func: UnsafeCell<Option<F>>,
    result: UnsafeCell<Option<std::thread::Result<R>>>,
}

// Safety: the interior cells are accessed by exactly one side at a time,
// sequenced by the rendezvous state machine.
unsafe impl<F: Send, R: Send> Send for SpawnFrame<F, R> {}
// Safety: see above.
unsafe impl<F: Send, R: Send> Sync for SpawnFrame<F, R> {}

// === impl SpawnFrame ===

impl<F, R> SpawnFrame<F, R>
where
    F: FnOnce() -> R,
{
    fn new(func: F) -> Self {
        Self {
            base: FrameBase::new(invoke::<F, R>),
            func: UnsafeCell::new(Some(func)),
            result: UnsafeCell::new(None),
        }
    }

    /// Awaits the computation and takes the result out of the frame.
    fn collect(&self) -> std::thread::Result<R> {
        self.base.rendezvous();
        // Safety: after the rendezvous the executing side is done with the
        // slot, and each frame is collected exactly once.
        unsafe { (*self.result.get()).take() }.expect("spawn frame collected twice")
    }
}

/// Runs the user closure and stores its outcome. A panic is captured here
/// and re-raised on the awaiting flow.
unsafe fn invoke<F, R>(frame: NonNull<FrameBase>)
where
    F: FnOnce() -> R,
{
    let frame = frame.cast::<SpawnFrame<F, R>>();
    // Safety: ensured by `execute_spawn_task`'s caller.
    let this = unsafe { frame.as_ref() };

    // Safety: only the executing side touches `func`, exactly once.
    let func = unsafe { (*this.func.get()).take() }.expect("spawned closure already taken");
    let result = panic::catch_unwind(AssertUnwindSafe(func));
    // Safety: only the executing side touches `result` until the
    // rendezvous has linearized.
    unsafe { *this.result.get() = Some(result) };
}

/// Handle to a spawned computation; see [`spawn`].
///
/// [`join`][Self::join] must be called exactly once: dropping an unjoined
/// future aborts the process, since the computation may still be writing
/// into the frame.
pub struct SpawnFuture<F: FnOnce() -> R, R> {
    frame: Option<NonNull<SpawnFrame<F, R>>>,
    _marker: PhantomData<SpawnFrame<F, R>>,
}

// Safety: the frame is heap-allocated and its cross-thread access is
// sequenced by the rendezvous; the closure and result both move between
// threads, hence the bounds.
unsafe impl<F, R> Send for SpawnFuture<F, R> where F: FnOnce() -> R + Send, R: Send {}

// === impl SpawnFuture ===

impl<F, R> SpawnFuture<F, R>
where
    F: FnOnce() -> R,
{
    /// Awaits the result of the computation.
    ///
    /// If the computation has already finished this returns immediately on
    /// the calling thread. Otherwise the calling flow is carried over to
    /// whichever thread finishes the computation (see the module docs); it
    /// continues without blocking, but possibly on a different OS thread.
    /// A panic raised by the spawned closure resumes on the caller.
    pub fn join(mut self) -> R {
        let frame = self.frame.take().expect("spawn future already joined");
        // Safety: alive until freed below; `join` consumes the future so
        // this is the only collector.
        let frame_ref = unsafe { frame.as_ref() };
        frame_ref.base.claimed.store(true, Ordering::Relaxed);
        let result = frame_ref.collect();

        // The computation is over, nothing aliases the frame anymore.
        // Safety: allocated with `Box::new` in `spawn`, collected once.
        drop(unsafe { Box::from_raw(frame.as_ptr()) });

        match result {
            Ok(value) => value,
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

impl<F: FnOnce() -> R, R> Drop for SpawnFuture<F, R> {
    fn drop(&mut self) {
        if self.frame.is_some() {
            // The frame may be queued or running; there is no way to
            // release it safely without the rendezvous.
            tracing::error!("spawn future dropped without joining it");
            std::process::abort();
        }
    }
}

impl<F: FnOnce() -> R, R> core::fmt::Debug for SpawnFuture<F, R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpawnFuture").finish_non_exhaustive()
    }
}

/// Clonable handle to a spawned computation; see [`escaping_spawn`].
///
/// All clones refer to the same computation and exactly one of them must
/// [`join`][Self::join] it.
pub struct EscapingSpawnFuture<F: FnOnce() -> R, R> {
    frame: Option<Arc<SpawnFrame<F, R>>>,
}

// === impl EscapingSpawnFuture ===

impl<F, R> EscapingSpawnFuture<F, R>
where
    F: FnOnce() -> R,
{
    /// Awaits the result of the computation; see [`SpawnFuture::join`].
    ///
    /// Aborts the process if another clone has already joined.
    pub fn join(mut self) -> R {
        let frame = self.frame.take().expect("spawn future already joined");
        if frame.base.claimed.swap(true, Ordering::AcqRel) {
            tracing::error!("escaping spawn joined more than once");
            std::process::abort();
        }
        let result = frame.collect();
        drop(frame);

        match result {
            Ok(value) => value,
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

impl<F: FnOnce() -> R, R> Clone for EscapingSpawnFuture<F, R> {
    fn clone(&self) -> Self {
        Self {
            frame: self.frame.clone(),
        }
    }
}

impl<F: FnOnce() -> R, R> Drop for EscapingSpawnFuture<F, R> {
    fn drop(&mut self) {
        let Some(frame) = self.frame.take() else {
            return;
        };
        // Only the drop of the very last clone can tell that nobody joined.
        if let Some(frame) = Arc::into_inner(frame) {
            if !frame.base.claimed.load(Ordering::Relaxed) {
                tracing::error!("escaping spawn dropped without joining it");
                std::process::abort();
            }
        }
    }
}

impl<F: FnOnce() -> R, R> core::fmt::Debug for EscapingSpawnFuture<F, R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EscapingSpawnFuture").finish_non_exhaustive()
    }
}

/// Spawns `f` onto the global thread pool.
///
/// The returned future must be [`join`][SpawnFuture::join]ed exactly once,
/// and code following the `join` may find itself on a different OS thread
/// (thread-local state must not be assumed stable across it). Use
/// [`ThreadSnapshot`][crate::ThreadSnapshot] to get back if that matters.
pub fn spawn<F, R>(f: F) -> SpawnFuture<F, R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let frame = NonNull::from(Box::leak(Box::new(SpawnFrame::new(f))));
    // Safety: the frame is heap-allocated with a stable address; the
    // future's join/drop contract keeps it alive until collected.
    unsafe {
        global_thread_pool().enqueue(NonNull::from(&frame.as_ref().base.task));
    }
    SpawnFuture {
        frame: Some(frame),
        _marker: PhantomData,
    }
}

/// Like [`spawn`], but the returned future can be cloned and sent around
/// freely. Exactly one clone must join.
pub fn escaping_spawn<F, R>(f: F) -> EscapingSpawnFuture<F, R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let frame = Arc::new(SpawnFrame::new(f));
    // Safety: the frame is kept alive by the `Arc`; the join-exactly-once
    // contract keeps it alive while queued.
    unsafe {
        global_thread_pool().enqueue(NonNull::from(&frame.base.task));
    }
    EscapingSpawnFuture { frame: Some(frame) }
}

static_assertions::assert_impl_all!(SpawnFuture<fn() -> u32, u32>: Send);
static_assertions::assert_impl_all!(EscapingSpawnFuture<fn() -> u32, u32>: Send, Sync, Clone);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_starts_initial() {
        let frame = SpawnFrame::new(|| 1);
        assert_eq!(frame.base.sync_state.load(Ordering::Relaxed), INITIAL);
        assert!(!frame.base.secondary.is_set());
        // Never queued, so dropping it is fine.
    }

    #[test]
    fn suspension_slot_roundtrip() {
        let slot = SuspensionSlot::new();
        assert!(!slot.is_set());

        let raw = NonZeroUsize::new(0x1000).unwrap();
        // Safety: the raw value is only inspected, never resumed.
        unsafe {
            slot.store_release(raw);
            assert!(slot.is_set());
            assert_eq!(slot.take(Ordering::Acquire).into_raw(), raw);
        }
        assert!(!slot.is_set());
    }
}
