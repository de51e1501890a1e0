// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicU32, Ordering};
use crate::loom::thread::Thread;
use parking_lot::Mutex;

const IDLE: u32 = 0;
const ARMED: u32 = 1;
const NOTIFIED: u32 = 2;
const INVALID: u32 = 3;

/// Single-shot park/notify slot: one thread arms it and waits, any thread
/// notifies, and the sleeper invalidates it on the way out so a straggling
/// notification becomes a no-op.
///
/// Which OS thread sleeps on a given slot changes over time (scheduling
/// loops migrate between threads), so the sleeper registers itself in
/// [`WakeupSlot::arm`] rather than at construction.
#[derive(Debug)]
pub(crate) struct WakeupSlot {
    state: AtomicU32,
    sleeper: Mutex<Option<Thread>>,
}

// === impl WakeupSlot ===

impl WakeupSlot {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU32::new(IDLE),
            sleeper: Mutex::new(None),
        }
    }

    /// Arms the slot for the calling thread. Must precede [`WakeupSlot::sleep`].
    ///
    /// Never inlined: the calling loop migrates between OS threads through
    /// continuation switches, and the thread handle must be derived fresh
    /// each time.
    #[inline(never)]
    pub(crate) fn arm(&self) {
        *self.sleeper.lock() = Some(crate::loom::thread::current());
        self.state.store(ARMED, Ordering::Release);
    }

    /// Parks until notified. Spurious wakeups are absorbed here; callers
    /// still re-check their own conditions after waking.
    pub(crate) fn sleep(&self) {
        while self.state.load(Ordering::Acquire) == ARMED {
            crate::loom::thread::park();
        }
    }

    /// Wakes the armed sleeper, if any. A no-op once the slot has been
    /// invalidated or was never armed.
    pub(crate) fn notify(&self) {
        if self
            .state
            .compare_exchange(ARMED, NOTIFIED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some(sleeper) = self.sleeper.lock().as_ref() {
                sleeper.unpark();
            }
        }
    }

    /// Retires the current arming; a later [`WakeupSlot::notify`] does
    /// nothing.
    pub(crate) fn invalidate(&self) {
        self.state.store(INVALID, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::sync::Arc;
    use crate::loom::thread;

    #[test]
    fn notify_wakes_sleeper() {
        crate::loom::model(|| {
            let slot = Arc::new(WakeupSlot::new());
            slot.arm();

            let notifier = {
                let slot = slot.clone();
                thread::spawn(move || slot.notify())
            };

            slot.sleep();
            slot.invalidate();
            notifier.join().unwrap();
        });
    }

    #[test]
    fn notify_before_sleep_is_not_lost() {
        let slot = WakeupSlot::new();
        slot.arm();
        slot.notify();
        // The state flip means sleep() returns immediately.
        slot.sleep();
        slot.invalidate();
    }

    #[test]
    fn notify_after_invalidate_is_noop() {
        let slot = WakeupSlot::new();
        slot.arm();
        slot.invalidate();
        slot.notify();
        assert_eq!(slot.state.load(Ordering::Relaxed), INVALID);
    }

    #[test]
    fn unarmed_notify_is_noop() {
        let slot = WakeupSlot::new();
        slot.notify();
        assert_eq!(slot.state.load(Ordering::Relaxed), IDLE);
    }
}
