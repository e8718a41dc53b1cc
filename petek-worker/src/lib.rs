//! Pinned worker-group execution engine.
//!
//! A [`WorkerGroup`] owns a fixed pool of worker threads, each with a
//! private inbox (one lane of a [`petek_queue::DispatchQueue`]), a
//! worker-private hierarchical timer wheel, and an optional [`Poller`].
//! Clients post work from any thread — immediate, delayed, or periodic —
//! and workers drain it in batches interleaved with timer ticks and poll
//! cycles.
//!
//! Each task is bound to exactly one worker at submission time; there is no
//! work stealing and no pool resizing. Per (producer thread, worker) pair
//! the execution order is strictly FIFO; nothing more is promised across
//! producers or across workers.
//!
//! # Example
//!
//! ```rust
//! use petek_worker::WorkerGroup;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let group = WorkerGroup::new(2, 1024);
//! let counter = Arc::new(AtomicUsize::new(0));
//! for _ in 0..100 {
//!     let counter = counter.clone();
//!     group.post_task(move || {
//!         counter.fetch_add(1, Ordering::Relaxed);
//!     }).unwrap();
//! }
//! # while counter.load(Ordering::Relaxed) < 100 { std::thread::yield_now(); }
//! ```
//!
//! Dropping the group signals every worker, joins their threads, and
//! discards queued tasks; in-flight tasks run to completion.

mod error;
mod group;
mod poller;
mod wheel;
mod worker;

pub use error::PostError;
pub use group::{GroupOptions, PanicHook, WorkerGroup};
pub use poller::{Poller, PollerSupplier};
pub use worker::{Task, Worker};
