// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end rendezvous scenarios.
//!
//! Tests that can trigger a thread inversion revert to their original OS
//! thread before returning, otherwise the harness would wait for a test
//! function that finished on a pool worker.

use concore::{ThreadSnapshot, escaping_spawn, global_thread_pool, spawn};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .try_init();
}

#[test]
fn spawn_executes_work() {
    init_tracing();
    let snapshot = ThreadSnapshot::take();

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    let future = spawn({
        let calls = calls.clone();
        move || {
            calls.fetch_add(1, Ordering::Release);
            tx.send(()).unwrap();
            13
        }
    });

    rx.recv_timeout(Duration::from_secs(10)).unwrap();
    thread::sleep(Duration::from_millis(1));
    global_thread_pool().drain();

    assert_eq!(future.join(), 13);
    assert_eq!(calls.load(Ordering::Acquire), 1);

    snapshot.revert();
}

#[test]
fn join_before_completion_inverts() {
    init_tracing();
    let snapshot = ThreadSnapshot::take();
    let entry_thread = thread::current().id();

    let (started_tx, started_rx) = mpsc::channel();
    let future = spawn(move || {
        started_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(100));
        7
    });

    // Only join once a worker is definitely executing the closure, so this
    // is the await-first arm of the rendezvous and not the inline path.
    started_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(future.join(), 7);

    // Our flow kept running without blocking, on whichever thread finished
    // the closure; make sure we end where the harness expects us.
    snapshot.revert();
    assert_eq!(thread::current().id(), entry_thread);
}

#[test]
fn join_after_completion_returns_directly() {
    init_tracing();
    let snapshot = ThreadSnapshot::take();

    let (done_tx, done_rx) = mpsc::channel();
    let future = spawn(move || {
        done_tx.send(()).unwrap();
        7
    });

    done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    // Let the worker get through the completion protocol as well.
    thread::sleep(Duration::from_millis(100));

    assert_eq!(future.join(), 7);
    snapshot.revert();
}

#[test]
fn join_without_started_worker_runs_inline() {
    init_tracing();
    let snapshot = ThreadSnapshot::take();

    // With the pool saturated by sleepers there is a fair chance the frame
    // has not been picked up when we join; either way the join must return
    // the value exactly once.
    let blockers: Vec<_> = (0..thread::available_parallelism().map_or(1, usize::from))
        .map(|_| spawn(|| thread::sleep(Duration::from_millis(50))))
        .collect();

    let future = spawn(|| 21);
    assert_eq!(future.join(), 21);

    for blocker in blockers {
        blocker.join();
    }
    snapshot.revert();
}

#[test]
fn independent_spawns_commute() {
    init_tracing();
    let snapshot = ThreadSnapshot::take();

    let a = spawn(|| 1u64);
    let b = spawn(|| 2u64);
    assert_eq!((a.join(), b.join()), (1, 2));

    let c = spawn(|| 3u64);
    let d = spawn(|| 4u64);
    assert_eq!((d.join(), c.join()), (4, 3));

    snapshot.revert();
}

#[test]
fn saturation() {
    init_tracing();
    let snapshot = ThreadSnapshot::take();

    let workers = thread::available_parallelism().map_or(1, usize::from);
    let count = 4 * workers;

    let futures: Vec<_> = (0..count).map(|i| escaping_spawn(move || i)).collect();
    let total: usize = futures.into_iter().map(|future| future.join()).sum();

    assert_eq!(total, count * (count - 1) / 2);
    snapshot.revert();
}

#[test]
fn escaping_future_can_move_between_threads() {
    init_tracing();
    let snapshot = ThreadSnapshot::take();

    let future = escaping_spawn(|| 99);
    let clone = future.clone();
    drop(future);

    // The helper joins from its own thread; it has to revert too so the OS
    // thread `thread::spawn` created is the one that finishes the closure.
    let value = thread::spawn(move || {
        let snapshot = ThreadSnapshot::take();
        let value = clone.join();
        snapshot.revert();
        value
    })
    .join()
    .unwrap();
    assert_eq!(value, 99);

    snapshot.revert();
}

#[test]
fn nested_spawns() {
    init_tracing();
    let snapshot = ThreadSnapshot::take();

    let future = spawn(|| {
        let inner = spawn(|| 20);
        inner.join() + 1
    });
    assert_eq!(future.join(), 21);

    snapshot.revert();
}

#[test]
fn propagates_panic_payload() {
    init_tracing();
    let snapshot = ThreadSnapshot::take();

    let (done_tx, done_rx) = mpsc::channel();
    let future = spawn(move || -> u32 {
        done_tx.send(()).unwrap();
        panic!("boom");
    });

    // Wait for completion so the unwind happens locally on this thread and
    // the harness observes an ordinary test panic...
    done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    thread::sleep(Duration::from_millis(100));

    // ...which we intercept ourselves.
    let result = panic::catch_unwind(AssertUnwindSafe(|| future.join()));
    let payload = result.unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));

    snapshot.revert();
}
