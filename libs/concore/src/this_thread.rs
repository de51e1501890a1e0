// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thread identity across inversions.
//!
//! A rendezvous in [`spawn`][crate::spawn] swaps which OS thread carries
//! which logical flow, so after an await a flow may find itself on a
//! different thread than the one it started on. Most code does not care.
//! Two things do:
//!
//! - a pool worker must return from its main loop on the OS thread it was
//!   spawned on, otherwise joining the pool would deadlock;
//! - a caller that *must* end up where it started (tests, thread-affine
//!   callers) can capture a [`ThreadSnapshot`] and revert to it.
//!
//! Every OS thread owns a `ThreadHome`, a small thread-local mailbox. A flow
//! that wants its original thread back posts its continuation into that
//! thread's `restore` slot and starts serving the thread it is stranded on.
//! Whatever flow currently occupies the original thread hands it over at its
//! next [`inversion_checkpoint`], parking its own continuation in the
//! stranded thread's `adopt` slot. Each handover frees exactly one thread
//! and fills exactly one, so chains of displaced flows unwind pairwise and
//! the permutation resolves without a coordinator.

use crate::loom::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use callcc::{Continuation, callcc};
use core::num::NonZeroUsize;
use core::ptr::{self, NonNull};
use crossbeam_utils::Backoff;

/// Per-OS-thread identity and swap mailbox.
pub(crate) struct ThreadHome {
    /// Continuation of this thread's displaced owner, waiting to return.
    /// Zero when empty.
    restore: AtomicUsize,
    /// The home of the OS thread that posted `restore` and is now without a
    /// flow of its own.
    restore_host: AtomicPtr<ThreadHome>,
    /// Continuation handed to this thread after it surrendered its flow.
    /// Zero when empty.
    adopt: AtomicUsize,
}

thread_local! {
    static HOME: ThreadHome = ThreadHome {
        restore: AtomicUsize::new(0),
        restore_host: AtomicPtr::new(ptr::null_mut()),
        adopt: AtomicUsize::new(0),
    };
}

/// The home of the calling OS thread.
///
/// The pointer is valid for the lifetime of the thread; the swap protocol
/// only ever stores it while the thread is alive and waiting.
///
/// Never inlined: callers sit in loops that migrate between OS threads
/// through continuation switches the compiler cannot see, and a hoisted
/// thread-local address would go stale after a migration.
#[inline(never)]
fn current_home() -> NonNull<ThreadHome> {
    HOME.with(|home| NonNull::from(home))
}

/// A record of which OS thread the calling flow was on.
#[derive(Debug)]
pub struct ThreadSnapshot {
    home: NonNull<ThreadHome>,
}

// === impl ThreadSnapshot ===

impl ThreadSnapshot {
    /// Captures the identity of the current OS thread.
    #[must_use]
    pub fn take() -> Self {
        Self {
            home: current_home(),
        }
    }

    /// Returns whether the calling flow is still (or again) on the thread
    /// the snapshot was taken on.
    pub fn is_current(&self) -> bool {
        self.home == current_home()
    }

    /// Moves the calling flow back onto the OS thread the snapshot was
    /// taken on. A no-op if it is already there.
    ///
    /// The original thread is currently carrying some other flow; this
    /// blocks (serving handover duty for the thread we are stranded on)
    /// until that flow passes an [`inversion_checkpoint`] and yields the
    /// thread back.
    pub fn revert(self) {
        let cur = current_home();
        if cur == self.home {
            return;
        }
        tracing::trace!("reverting flow to its original thread");

        let home = self.home;
        let _ = callcc(move |cc| {
            // Safety: `home` belongs to a live OS thread: the thread cannot
            // exit while a flow that started on it is still running
            // elsewhere.
            let home_ref = unsafe { home.as_ref() };
            home_ref.restore_host.store(cur.as_ptr(), Ordering::Relaxed);
            home_ref.restore.store(cc.into_raw().get(), Ordering::Release);

            // The flow occupying our home thread may be a sleeping worker;
            // make sure every worker rechecks its checkpoint.
            crate::thread_pool::wake_global_workers();

            wait_for_flow(cur)
        });

        debug_assert!(current_home() == home);
    }
}

/// Cooperative identity yield point.
///
/// If the original owner of the calling OS thread has asked for it back,
/// this hands the thread over and continues the calling flow on the OS
/// thread the owner vacated. Workers call this at the top of every loop
/// iteration; it is cheap when no restore is pending.
pub fn inversion_checkpoint() {
    let cur = current_home();
    // Safety: `cur` is the calling thread's own home.
    let cur_ref = unsafe { cur.as_ref() };
    if cur_ref.restore.load(Ordering::Acquire) == 0 {
        return;
    }
    surrender(cur);
}

#[cold]
fn surrender(cur: NonNull<ThreadHome>) {
    // Safety: `cur` is the calling thread's own home.
    let cur_ref = unsafe { cur.as_ref() };

    let raw = cur_ref.restore.load(Ordering::Acquire);
    let host = cur_ref.restore_host.load(Ordering::Relaxed);
    cur_ref.restore.store(0, Ordering::Relaxed);
    debug_assert!(raw != 0 && !host.is_null());

    // Safety: non-zero by the check above, posted via `Continuation::into_raw`.
    let owner = unsafe { Continuation::from_raw(NonZeroUsize::new_unchecked(raw)) };

    tracing::trace!("surrendering thread to its returning owner");
    let _ = callcc(move |cc| {
        // Hand the current flow to the thread the owner vacated, then let
        // the owner have this one.
        // Safety: the posting thread is alive, blocked in `wait_for_flow`.
        unsafe { (*host).adopt.store(cc.into_raw().get(), Ordering::Release) };
        owner
    });
    // Resumed on the host thread the restore was posted from.
}

/// Hosting duty of a thread whose flow has departed: wait until either a
/// surrendered flow is handed to us, or this thread's own owner returns.
fn wait_for_flow(cur: NonNull<ThreadHome>) -> Continuation {
    // Safety: `cur` is the calling thread's own home.
    let cur_ref = unsafe { cur.as_ref() };
    let backoff = Backoff::new();
    loop {
        let adopted = cur_ref.adopt.swap(0, Ordering::Acquire);
        if let Some(raw) = NonZeroUsize::new(adopted) {
            // Safety: posted via `Continuation::into_raw` by a surrendering
            // flow.
            return unsafe { Continuation::from_raw(raw) };
        }

        // The thread's own owner coming back counts too: we are without a
        // flow, so it can take over directly.
        let restored = cur_ref.restore.load(Ordering::Acquire);
        if let Some(raw) = NonZeroUsize::new(restored) {
            cur_ref.restore.store(0, Ordering::Relaxed);
            // Safety: as above.
            return unsafe { Continuation::from_raw(raw) };
        }

        backoff.snooze();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revert_on_home_thread_is_noop() {
        let snapshot = ThreadSnapshot::take();
        assert!(snapshot.is_current());
        snapshot.revert();
    }

    #[test]
    fn checkpoint_without_pending_restore_is_noop() {
        inversion_checkpoint();
        inversion_checkpoint();
    }
}
