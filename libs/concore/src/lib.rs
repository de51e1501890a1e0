// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Structured parallelism on stackful continuations, without blocking and
//! without async coloring.
//!
//! [`spawn`] hands a closure to a work-stealing thread pool and returns a
//! future; [`SpawnFuture::join`] returns the closure's value. If the value
//! is not ready yet, the awaiting flow does not block: its continuation
//! migrates onto the worker that is running the closure, while the awaiting
//! OS thread picks up that worker's scheduling loop. Every OS thread keeps
//! doing useful work; only the assignment of logical flows to OS threads
//! changes ("thread inversion").
//!
//! The consequence to be aware of: code after a `join` may run on a
//! different OS thread than code before it. Don't cache thread-locals
//! across a join; if a flow must end up back where it started, capture a
//! [`ThreadSnapshot`] and revert it.
//!
//! ```
//! let a = concore::spawn(|| 40);
//! let b = concore::spawn(|| 2);
//! assert_eq!(a.join() + b.join(), 42);
//! ```
//!
//! The building blocks are exported too: [`ThreadPool`] (per-worker
//! intrusive work lines, round-robin dispatch with a steal sweep) and the
//! raw [`Task`] node for code that manages its own frames. The continuation
//! primitive lives in the `callcc` crate.
//!
//! The worker count of the global pool is `CONCORE_MAX_CONCURRENCY` if set,
//! the hardware parallelism otherwise.

mod loom;
mod spawn;
mod task;
pub mod this_thread;
mod thread_pool;
mod wake;
mod work_line;

pub use spawn::{EscapingSpawnFuture, SpawnFuture, escaping_spawn, spawn};
pub use task::{Task, TaskFn};
pub use this_thread::{ThreadSnapshot, inversion_checkpoint};
pub use thread_pool::{ThreadPool, global_thread_pool};
