// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The work-distributing thread pool.
//!
//! `N` worker threads each own one [`WorkLine`]; enqueueing picks a line
//! round-robin and falls back to trying every other line before blocking,
//! popping sweeps the lines starting from a per-wakeup hint. There is no
//! ordering guarantee between independent tasks.
//!
//! Workers cooperate with thread inversion: each loop iteration passes an
//! [`inversion_checkpoint`][crate::this_thread::inversion_checkpoint], and a
//! worker whose loop ended up on a foreign OS thread migrates back before
//! its thread function returns, so joining the pool always joins threads
//! that are about to finish on their own stacks.

use crate::loom::sync::Arc;
use crate::loom::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use crate::loom::thread;
use crate::task::Task;
use crate::this_thread::{self, ThreadSnapshot};
use crate::wake::WakeupSlot;
use crate::work_line::WorkLine;
use core::num::NonZeroUsize;
use core::ptr::NonNull;
use crossbeam_utils::Backoff;
use std::env;
use std::thread::JoinHandle;

/// Environment variable overriding the worker count.
const MAX_CONCURRENCY_ENV: &str = "CONCORE_MAX_CONCURRENCY";

#[derive(Debug)]
struct WorkerData {
    /// Pending wake requests. Starts at 1 ("awake"); a worker going to
    /// sleep decrements it and only parks when it reaches zero, a notifier
    /// incrementing it from zero owns the wakeup.
    wake_requests: AtomicU32,
    wakeup: WakeupSlot,
    /// Work line index a woken worker starts its pop sweep at.
    start_hint: AtomicUsize,
}

#[derive(Debug)]
struct Shared {
    work_lines: Box<[WorkLine]>,
    workers: Box<[WorkerData]>,
    /// Tasks currently queued across all lines. Incremented by enqueue,
    /// decremented when a task is popped or extracted.
    num_tasks: AtomicUsize,
    /// Round-robin cursor for enqueue; wraps freely.
    line_to_push_to: AtomicU32,
    stop_requested: AtomicBool,
}

/// A pool of worker threads executing [`Task`]s.
///
/// The process-wide instance used by [`spawn`][crate::spawn] is
/// [`global_thread_pool`]; separate pools exist mainly so that lifecycle
/// behaviour (drain, join, destruction) is testable.
#[derive(Debug)]
pub struct ThreadPool {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

static_assertions::assert_impl_all!(ThreadPool: Send, Sync);

// === impl WorkerData ===

impl WorkerData {
    fn new() -> Self {
        Self {
            wake_requests: AtomicU32::new(1),
            wakeup: WakeupSlot::new(),
            start_hint: AtomicUsize::new(0),
        }
    }

    /// Tries to claim the wakeup of this worker. Returns `false` when the
    /// worker is already awake (or another notifier beat us to it).
    fn try_notify(&self, work_line_hint: usize) -> bool {
        if self.wake_requests.fetch_add(1, Ordering::Acquire) == 0 {
            // Tell the sleeping worker where to start looking for work.
            self.start_hint.store(work_line_hint, Ordering::Relaxed);
            self.wakeup.notify();
            true
        } else {
            false
        }
    }

    /// Parks the calling thread until notified (or until there is reason to
    /// believe new work exists). Returns the line index to start sweeping
    /// from.
    fn sleep(&self, stop_requested: &AtomicBool) -> usize {
        self.wakeup.arm();
        if self.wake_requests.fetch_sub(1, Ordering::AcqRel) == 1 {
            if !stop_requested.load(Ordering::Relaxed) {
                self.wakeup.sleep();
            }
        }
        self.wakeup.invalidate();
        self.wake_requests.store(1, Ordering::Release);
        self.start_hint.load(Ordering::Acquire)
    }
}

// === impl Shared ===

impl Shared {
    /// Accounts for a freshly enqueued task and wakes one worker for it.
    /// If tasks already outnumber the workers, somebody is certain to be
    /// awake and no notification is needed.
    fn notify_one(&self, work_line_hint: usize) {
        let old = self.num_tasks.fetch_add(1, Ordering::Relaxed);
        if old <= self.workers.len() {
            for worker in &self.workers {
                if worker.try_notify(work_line_hint) {
                    return;
                }
            }
        }
    }
}

// === impl ThreadPool ===

impl ThreadPool {
    /// Creates a pool with [`concurrency`] worker threads.
    pub fn new() -> Self {
        Self::with_threads(concurrency())
    }

    /// Creates a pool with exactly `thread_count` worker threads.
    ///
    /// # Panics
    ///
    /// Panics if `thread_count` is zero or a worker thread cannot be
    /// spawned.
    pub fn with_threads(thread_count: usize) -> Self {
        assert!(thread_count > 0, "thread pool needs at least one worker");

        let shared = Arc::new(Shared {
            work_lines: (0..thread_count).map(|_| WorkLine::new()).collect(),
            workers: (0..thread_count).map(|_| WorkerData::new()).collect(),
            num_tasks: AtomicUsize::new(0),
            line_to_push_to: AtomicU32::new(0),
            stop_requested: AtomicBool::new(false),
        });

        let threads = (0..thread_count)
            .map(|index| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("worker-{index}"))
                    .spawn(move || thread_main(&shared, index))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { shared, threads }
    }

    /// Queues `task` for execution on some worker.
    ///
    /// # Safety
    ///
    /// `task` must be detached and must stay alive until it has been
    /// executed or successfully extracted with [`ThreadPool::extract_task`].
    pub unsafe fn enqueue(&self, task: NonNull<Task>) {
        tracing::trace!(?task, "enqueue");
        {
            // Safety: ensured by caller
            let task = unsafe { task.as_ref() };
            task.next.set(core::ptr::null_mut());
            task.prev_link.set(core::ptr::null());
        }

        let line_count = self.shared.work_lines.len() as u32;
        let index = self.shared.line_to_push_to.fetch_add(1, Ordering::Relaxed) % line_count;

        // Try to hand the task to a line without blocking.
        for i in 0..line_count {
            let current = ((index + i) % line_count) as usize;
            // Safety: ensured by caller
            if unsafe { self.shared.work_lines[current].try_push(task) } {
                self.shared.notify_one(current);
                return;
            }
        }

        // Every line was contended; force-push to the chosen one.
        let current = index as usize;
        // Safety: ensured by caller
        unsafe { self.shared.work_lines[current].push(task) };
        self.shared.notify_one(current);
    }

    /// Removes a task that no worker has started yet.
    ///
    /// Returns `true` if the task was unlinked, in which case it will never
    /// be executed by the pool. Returns `false` if a worker already picked
    /// it up (or it was never queued here).
    ///
    /// # Safety
    ///
    /// `task` must be alive and, if queued, queued on this pool.
    pub unsafe fn extract_task(&self, task: NonNull<Task>) -> bool {
        // Safety: ensured by caller
        let line = unsafe { task.as_ref() }.worker_data.load(Ordering::Acquire);
        let Some(line) = NonNull::new(line) else {
            return false;
        };

        // Safety: a non-null `worker_data` names a line of this pool, which
        // is alive; `extract` re-checks membership under the line lock.
        let extracted = unsafe { line.as_ref().extract(task) };
        if extracted {
            self.shared.num_tasks.fetch_sub(1, Ordering::Release);
        }
        extracted
    }

    /// Busy-waits until every queued task has been picked up by a worker
    /// (or run inline by an awaiter).
    pub fn drain(&self) {
        let backoff = Backoff::new();
        while self.shared.num_tasks.load(Ordering::Acquire) > 0 {
            this_thread::inversion_checkpoint();
            backoff.snooze();
        }
    }

    /// Stops and joins all worker threads.
    ///
    /// Queued tasks that no worker has picked up yet stay queued; the
    /// normal shutdown sequence is [`ThreadPool::drain`] followed by drop.
    pub fn join(&mut self) {
        tracing::debug!("joining thread pool");
        self.shared.stop_requested.store(true, Ordering::Release);
        for worker in &self.shared.workers {
            worker.try_notify(0);
        }

        for handle in self.threads.drain(..) {
            // A worker whose loop was carried off by an inversion needs its
            // OS thread handed back before it can finish; keep serving
            // checkpoints while we wait.
            let backoff = Backoff::new();
            while !handle.is_finished() {
                this_thread::inversion_checkpoint();
                backoff.snooze();
            }
            handle.join().expect("worker thread panicked");
        }
    }

    pub(crate) fn wake_workers(&self) {
        for worker in &self.shared.workers {
            worker.try_notify(0);
        }
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if self.shared.num_tasks.load(Ordering::Relaxed) > 0 {
            // Destroying the pool with queued tasks would leave intrusive
            // nodes linked into freed lines; users must drain first.
            tracing::error!("thread pool destroyed with queued tasks");
            std::process::abort();
        }
        self.join();
    }
}

/// The desired level of concurrency: the `CONCORE_MAX_CONCURRENCY`
/// environment variable if set to a positive integer, the hardware
/// parallelism otherwise.
fn concurrency() -> usize {
    if let Ok(value) = env::var(MAX_CONCURRENCY_ENV) {
        match value.parse::<usize>() {
            Ok(count) if count > 0 => return count,
            _ => tracing::warn!(
                %value,
                "ignoring invalid {MAX_CONCURRENCY_ENV}, falling back to hardware concurrency"
            ),
        }
    }

    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

fn thread_main(shared: &Shared, thread_index: usize) {
    tracing::debug!(worker = thread_index, "worker thread start");

    // We need to exit on the same OS thread we entered on, no matter how
    // many inversions carry this loop around in between.
    let snapshot = ThreadSnapshot::take();

    let line_count = shared.work_lines.len();
    let mut work_line_hint = thread_index;

    while !shared.stop_requested.load(Ordering::Relaxed) {
        // First check whether somebody needs this OS thread back.
        this_thread::inversion_checkpoint();

        if shared.num_tasks.load(Ordering::Acquire) == 0 {
            work_line_hint = shared.workers[thread_index].sleep(&shared.stop_requested);
        }

        // Sweep the lines twice so a pop that merely lost a lock race gets
        // a second chance before we consider sleeping again.
        let mut to_execute = None;
        for i in 0..2 * line_count {
            let line_index = (work_line_hint + i) % line_count;
            if let Some(task) = shared.work_lines[line_index].try_pop() {
                to_execute = Some((task, line_index));
                break;
            }
        }

        if let Some((task, line_index)) = to_execute {
            shared.num_tasks.fetch_sub(1, Ordering::Relaxed);
            tracing::trace!(?task, line_index, "execute");
            // Safety: the enqueue contract keeps the task alive until
            // executed, and try_pop detached it.
            unsafe { Task::execute(task, Some(line_index)) };
        }
    }

    snapshot.revert();
    tracing::debug!(worker = thread_index, "worker thread stop");
}

crate::loom::lazy_static! {
    static ref GLOBAL: ThreadPool = ThreadPool::new();
}

/// The process-wide pool used by [`spawn`][crate::spawn], created on first
/// use. It is never destroyed; all spawned work is expected to be awaited
/// before the process exits.
pub fn global_thread_pool() -> &'static ThreadPool {
    &GLOBAL
}

/// Re-arms every global worker's checkpoint, waking sleepers. Used when a
/// restore request is posted for a thread that may be carrying a sleeping
/// worker loop.
pub(crate) fn wake_global_workers() {
    global_thread_pool().wake_workers();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) {
        let start = Instant::now();
        let backoff = Backoff::new();
        while !cond() {
            assert!(start.elapsed() < deadline, "condition not reached in time");
            backoff.snooze();
        }
    }

    /// A task that bumps a counter when executed.
    #[repr(C)]
    struct CountTask {
        task: Task,
        counter: Arc<AtomicUsize>,
    }

    impl CountTask {
        fn new(counter: Arc<AtomicUsize>) -> Box<Self> {
            Box::new(Self {
                task: Task::new(Self::run),
                counter,
            })
        }

        unsafe fn run(task: NonNull<Task>, _line: Option<usize>) {
            // Safety: `task` is the first field of a live `CountTask`.
            let this = unsafe { task.cast::<CountTask>().as_ref() };
            this.counter.fetch_add(1, Ordering::Release);
        }
    }

    /// A task that signals that it started, then blocks until released.
    #[repr(C)]
    struct GateTask {
        task: Task,
        started: Arc<AtomicBool>,
        release: Arc<AtomicBool>,
    }

    impl GateTask {
        fn new(started: Arc<AtomicBool>, release: Arc<AtomicBool>) -> Box<Self> {
            Box::new(Self {
                task: Task::new(Self::run),
                started,
                release,
            })
        }

        unsafe fn run(task: NonNull<Task>, _line: Option<usize>) {
            // Safety: `task` is the first field of a live `GateTask`.
            let this = unsafe { task.cast::<GateTask>().as_ref() };
            this.started.store(true, Ordering::Release);
            let backoff = Backoff::new();
            while !this.release.load(Ordering::Acquire) {
                backoff.snooze();
            }
        }
    }

    #[test]
    fn executes_queued_tasks() {
        let mut pool = ThreadPool::with_threads(2);
        let counter = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..128).map(|_| CountTask::new(counter.clone())).collect();
        for task in &tasks {
            // Safety: the boxes outlive the pool operations below.
            unsafe { pool.enqueue(NonNull::from(&task.task)) };
        }

        pool.drain();
        wait_until(Duration::from_secs(10), || {
            counter.load(Ordering::Acquire) == tasks.len()
        });

        pool.join();
        // After join no task function runs again; the counter is final.
        assert_eq!(counter.load(Ordering::Acquire), tasks.len());
    }

    #[test]
    fn drain_then_destroy() {
        let pool = ThreadPool::with_threads(1);
        let started = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(true));
        let task = GateTask::new(started.clone(), release);

        // Safety: the box outlives the pool operations below.
        unsafe { pool.enqueue(NonNull::from(&task.task)) };

        wait_until(Duration::from_secs(10), || started.load(Ordering::Acquire));
        pool.drain();
        drop(pool);
    }

    #[test]
    fn extracted_task_never_runs() {
        let pool = ThreadPool::with_threads(1);

        // Occupy the single worker so the next task cannot be picked up.
        let started = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let gate = GateTask::new(started.clone(), release.clone());
        // Safety: the boxes outlive the pool operations below.
        unsafe { pool.enqueue(NonNull::from(&gate.task)) };
        wait_until(Duration::from_secs(10), || started.load(Ordering::Acquire));

        let counter = Arc::new(AtomicUsize::new(0));
        let victim = CountTask::new(counter.clone());
        // Safety: as above.
        unsafe { pool.enqueue(NonNull::from(&victim.task)) };

        // The worker is blocked, so the task must still be queued.
        // Safety: as above.
        assert!(unsafe { pool.extract_task(NonNull::from(&victim.task)) });
        // A second extract finds it detached.
        assert!(!unsafe { pool.extract_task(NonNull::from(&victim.task)) });

        release.store(true, Ordering::Release);
        pool.drain();
        drop(pool);

        assert_eq!(counter.load(Ordering::Acquire), 0);
    }

    #[test]
    fn concurrency_env_override() {
        // Not worth a process-level test; just exercise the parser paths.
        let n = concurrency();
        assert!(n >= 1);
    }
}
