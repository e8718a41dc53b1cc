//! Partitioned MPMC dispatch queue.
//!
//! One logical queue, `N` consumer lanes. Each producer thread registers an
//! [`Outbox`] bound to one lane; each lane has exactly one [`Inbox`] that
//! drains all of its outboxes. Every (producer, consumer) pair thus owns a
//! private SPSC ring, and the hot path carries no locks and no CAS on the
//! rings — one release store to publish, one acquire load to observe. The
//! only other cross-thread traffic is the consumer's wakeup signal.
//!
//! Ordering: items pushed through one outbox are popped in push order.
//! Across outboxes of the same lane there is no ordering, but draining is
//! round-robin with one item per outbox per pass, so no outbox starves.

mod dispatch;
mod ring;
mod signal;

pub use dispatch::{DispatchQueue, Inbox, Outbox, RegisterError, MAX_OUTBOXES_PER_LANE};
pub use signal::Signal;
