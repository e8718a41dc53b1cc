//! Petek: concurrent pointers with pluggable lock-free memory reclamation.
//!
//! A [`ConcurrentPtr`] is an atomically swappable pointer to a heap object.
//! Many readers may dereference it without ever waiting for writers; writers
//! publish a new referent and *retire* the old one. The retired object is
//! freed only once no protected view of it can exist in any thread — how that
//! is proven is the job of the reclamation strategy:
//!
//! - [`RefCount`] — tagged-pointer cell plus an in-node atomic reference
//!   count. Lock-free for readers and writers, immediate frees.
//! - [`Epoch`] — epoch-based reclamation: readers publish the epoch they
//!   observed, writers batch retirements into per-epoch buckets and sweep
//!   once every active reader has moved past the retirement epoch.
//! - [`Hazard`] — hazard pointers: readers publish the exact pointer they
//!   dereference, writers scan the hazard table before freeing.
//!
//! All three present the same protect/release/retire boundary ([`Reclaim`]),
//! so the pointer types never assume any one strategy's representation.
//!
//! # Example
//!
//! ```rust
//! use petek::ConcurrentPtr;
//!
//! let ptr: ConcurrentPtr<u64> = ConcurrentPtr::new();
//! ptr.reset(Box::new(42));
//!
//! // Scoped protected read.
//! if let Some(reader) = ptr.read() {
//!     assert_eq!(*reader, 42);
//! }
//!
//! // Publish a new value; the old one is retired and freed safely.
//! ptr.reset(Box::new(99));
//! ptr.clear();
//! ```

#![warn(missing_docs)]

mod deleter;
mod epoch;
mod hazard;
mod ptr;
mod reclaim;
mod refcount;
mod retired;
mod shared;
mod slots;
mod tls;

pub use deleter::{ArcDeleter, BoxDeleter, Deleter};
pub use epoch::Epoch;
pub use hazard::Hazard;
pub use ptr::{ConcurrentPtr, Reader};
pub use reclaim::Reclaim;
pub use refcount::RefCount;
pub use shared::ConcurrentSharedPtr;
